//! End-to-end run against the real host collaborators.
//!
//! The log sink and the state storage location are process-wide, so this
//! file holds a single test that runs its scenarios one after another.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vtpm_core::acquire::tpmstate::{self, DEFAULT_MODE};
use vtpm_core::{
    logging, Callbacks, CommandLoop, CtrlChannel, Descriptor, DeviceEngine, DirStore,
    EngineError, LoopContext, LoopError, NvStore, Resource, StateLocation, Supervisor,
    SupervisorError, SystemHost, TpmVersion,
};

#[derive(Default)]
struct BlobEngine {
    callbacks: Option<Callbacks>,
}

impl DeviceEngine for BlobEngine {
    fn choose_version(&mut self, _version: TpmVersion) -> Result<(), EngineError> {
        Ok(())
    }

    fn register_callbacks(&mut self, callbacks: Callbacks) -> Result<(), EngineError> {
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn start(&mut self, _version: TpmVersion, _storage_locked: bool) -> Result<(), EngineError> {
        let callbacks = self
            .callbacks
            .as_ref()
            .ok_or_else(|| EngineError::Start("no callbacks".into()))?;
        callbacks
            .nvram
            .init()
            .and_then(|()| callbacks.nvram.store("permall", b"initial state"))
            .map_err(|e| EngineError::Start(e.to_string()))
    }

    fn process(&mut self, _command: &[u8], _locality: u8) -> Vec<u8> {
        Vec::new()
    }

    fn terminate(&mut self) {}
}

#[derive(Debug, Default)]
struct Observed {
    pid: Option<String>,
    ctrl_socket: bool,
    server_socket: bool,
    endpoint: bool,
    log_configured: bool,
    state_registered: bool,
    storage_locked_elsewhere: bool,
}

struct ObservingLoop {
    dir: PathBuf,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl CommandLoop for ObservingLoop {
    type CtrlChannel = CtrlChannel;

    async fn run(&mut self, ctx: LoopContext<'_, CtrlChannel>) -> Result<(), LoopError> {
        let other = DirStore::new(StateLocation {
            dir: self.dir.join("state"),
            mode: DEFAULT_MODE,
            version: TpmVersion::Tpm2,
        });

        let mut observed = self.observed.lock().unwrap();
        observed.pid = std::fs::read_to_string(self.dir.join("vtpm.pid")).ok();
        observed.ctrl_socket = self.dir.join("ctrl.sock").exists();
        observed.server_socket = self.dir.join("server.sock").exists();
        observed.endpoint = ctx.params.endpoint.is_some();
        observed.log_configured = logging::is_configured();
        observed.state_registered = tpmstate::current().is_some();
        observed.storage_locked_elsewhere = other.lock_storage().is_err();
        Ok(())
    }
}

fn descriptor(dir: &Path) -> Descriptor {
    std::fs::write(dir.join("key"), "00112233445566778899aabbccddeeff\n").unwrap();
    Descriptor::builder()
        .log(format!("file={},level=4", dir.join("vtpm.log").display()))
        .pid(format!("file={}", dir.join("vtpm.pid").display()))
        .ctrl(format!(
            "type=unixio,path={},mode=0600",
            dir.join("ctrl.sock").display()
        ))
        .server(format!("type=unixio,path={}", dir.join("server.sock").display()))
        .tpmstate(format!("dir={}", dir.join("state").display()))
        .key(format!("file={}", dir.join("key").display()))
        .seccomp("action=none")
        .flags("startup-clear")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_system_host_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("state")).unwrap();

    // clean run
    let observed = Arc::new(Mutex::new(Observed::default()));
    let supervisor = Supervisor::new(
        SystemHost::new(),
        BlobEngine::default(),
        ObservingLoop {
            dir: dir.path().to_path_buf(),
            observed: observed.clone(),
        },
    );
    let report = supervisor.run(&descriptor(dir.path())).await;
    assert!(report.is_success(), "{:?}", report.result);
    assert_eq!(report.storage_locked, Some(true));

    {
        let observed = observed.lock().unwrap();
        assert_eq!(observed.pid, Some(format!("{}\n", std::process::id())));
        assert!(observed.ctrl_socket);
        assert!(observed.server_socket);
        assert!(observed.endpoint);
        assert!(observed.log_configured);
        assert!(observed.state_registered);
        assert!(observed.storage_locked_elsewhere);
    }

    assert!(!dir.path().join("vtpm.pid").exists());
    assert!(!dir.path().join("ctrl.sock").exists());
    assert!(!dir.path().join("server.sock").exists());
    assert!(dir.path().join("vtpm.log").exists());
    assert!(!logging::is_configured());
    assert!(tpmstate::current().is_none());
    assert_eq!(
        std::fs::read(dir.path().join("state").join("tpm2-00.permall")).unwrap(),
        b"initial state"
    );

    let store = DirStore::new(StateLocation {
        dir: dir.path().join("state"),
        mode: DEFAULT_MODE,
        version: TpmVersion::Tpm2,
    });
    store.lock_storage().unwrap();
    store.unlock_storage();

    // a bad control channel option fails after the log sink was configured
    let mut bad = descriptor(dir.path());
    bad.ctrl = Some("type=serial".into());
    let supervisor = Supervisor::new(
        SystemHost::new(),
        BlobEngine::default(),
        ObservingLoop {
            dir: dir.path().to_path_buf(),
            observed: Arc::default(),
        },
    );
    let report = supervisor.run(&bad).await;

    match &report.result {
        Err(SupervisorError::Acquire(e)) => assert_eq!(e.subsystem(), "ctrl"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(report.released, [Resource::Log]);
    assert!(!logging::is_configured());
    assert!(!dir.path().join("vtpm.pid").exists());

    // globals are free again for the next run
    let report = Supervisor::new(
        SystemHost::new(),
        BlobEngine::default(),
        ObservingLoop {
            dir: dir.path().to_path_buf(),
            observed: Arc::default(),
        },
    )
    .run(&descriptor(dir.path()))
    .await;
    assert!(report.is_success(), "{:?}", report.result);
}
