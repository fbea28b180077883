use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bgi_rt::{
    ClientState, Mode, ProcessLauncher, Registry, Session, SessionConfig, ShmRegistry,
    config::ENV_SESSION,
    names::{self, Namespace},
    objects::SharedObjects,
};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};

const SERVER: &str = env!("CARGO_BIN_EXE_bgi-server");
const STAND_IN_ENV: &str = "BGI_TEST_STAND_IN_SESSION";
const STAND_IN_READY: &str = "stand-in ready";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}-{}", std::process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            panic!("timed out waiting for child to exit");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn session_config(dir: &Path) -> SessionConfig {
    SessionConfig::new(320, 200, Mode::default())
        .expect("config")
        .with_namespace(Namespace::unique())
        .with_runtime_dir(dir)
        .with_startup_timeout(Duration::from_secs(10))
}

/// Play the client by hand: hold the client lease, spawn the server and wait
/// for it to come up.
fn spawn_server(registry: &ShmRegistry, command: &mut Command) -> (bgi_rt::lease::Lease, Child) {
    let lease = registry
        .acquire_lease(names::CLIENT_ALIVE)
        .expect("client lease");
    let started = registry
        .create_signal(names::SERVER_STARTED)
        .expect("started signal");
    let child = command
        .arg("--headless")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn bgi-server");
    assert!(
        started.wait_timeout(Duration::from_secs(10)),
        "server never signalled start"
    );
    (lease, child)
}

#[test]
fn killed_server_is_noticed_within_a_second() {
    let dir = unique_temp_dir("bgi-process-kill");
    let config = session_config(&dir);
    let lost = Arc::new(AtomicBool::new(false));
    let flag = lost.clone();
    let mut session = Session::builder(config.clone())
        .launcher(ProcessLauncher::new().with_program(SERVER).arg("--headless"))
        .on_peer_lost(move || flag.store(true, Ordering::SeqCst))
        .start()
        .expect("start session");

    let pid = session.server_id().expect("server pid");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("kill server");
    let killed_at = Instant::now();
    while !lost.load(Ordering::SeqCst) && killed_at.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(lost.load(Ordering::SeqCst), "peer loss never observed");
    assert!(killed_at.elapsed() < Duration::from_secs(1));
    assert_eq!(session.state(), ClientState::Terminating);

    session.close();
    let registry = ShmRegistry::for_config(&config);
    SharedObjects::unlink(&registry);
    registry.unlink(names::SERVER_ALIVE);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn released_client_lease_stops_the_server() {
    let dir = unique_temp_dir("bgi-process-release");
    let config = session_config(&dir);
    let registry = ShmRegistry::for_config(&config);

    let mut command = Command::new(SERVER);
    command.env(ENV_SESSION, config.to_env_value().expect("serialize"));
    let (lease, mut child) = spawn_server(&registry, &mut command);

    let objects = SharedObjects::open(&registry, &config).expect("open shared objects");
    assert_eq!(objects.state.width(), 320);
    drop(objects);

    drop(lease);
    let status = wait_for_exit(&mut child, Duration::from_secs(3));
    assert!(status.success(), "server exited with {status}");
    assert!(registry.open_section(names::SHARED_STATE).is_err());

    registry.unlink(names::SERVER_STARTED);
    registry.unlink(names::CLIENT_ALIVE);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn legacy_spawn_word_boots_a_server() {
    let dir = unique_temp_dir("bgi-process-word");
    let config = session_config(&dir);
    let registry = ShmRegistry::for_config(&config);
    let word = config.spawn_word().expect("spawn word");

    let mut command = Command::new(SERVER);
    command
        .env_remove(ENV_SESSION)
        .arg("--spawn-word")
        .arg(word.0.to_string())
        .arg("--namespace")
        .arg(config.namespace.as_str())
        .arg("--runtime-dir")
        .arg(&dir);
    let (lease, mut child) = spawn_server(&registry, &mut command);

    let objects = SharedObjects::open(&registry, &config).expect("open shared objects");
    assert_eq!((objects.state.width(), objects.state.height()), (320, 200));
    objects.request(bgi_rt::state::request::CLOSE);

    let status = wait_for_exit(&mut child, Duration::from_secs(3));
    assert!(status.success(), "server exited with {status}");
    drop(lease);

    registry.unlink(names::SERVER_STARTED);
    registry.unlink(names::CLIENT_ALIVE);
    let _ = fs::remove_dir_all(&dir);
}

/// Runs only when re-executed by `killed_client_stops_the_server`: holds the
/// client lease and the start signal until killed.
#[test]
fn client_stand_in() {
    let Ok(json) = std::env::var(STAND_IN_ENV) else {
        return;
    };
    let config = SessionConfig::from_env_value(&json).expect("stand-in config");
    let registry = ShmRegistry::for_config(&config);
    let _lease = registry
        .acquire_lease(names::CLIENT_ALIVE)
        .expect("client lease");
    let _started = registry
        .create_signal(names::SERVER_STARTED)
        .expect("started signal");
    println!("{STAND_IN_READY}");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

#[test]
fn killed_client_stops_the_server() {
    let dir = unique_temp_dir("bgi-process-client-kill");
    let config = session_config(&dir);
    let registry = ShmRegistry::for_config(&config);
    let json = config.to_env_value().expect("serialize");

    let mut client = Command::new(std::env::current_exe().expect("test binary"))
        .args(["--exact", "client_stand_in", "--nocapture", "--test-threads=1", "-q"])
        .env(STAND_IN_ENV, &json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn stand-in client");
    let stdout = client.stdout.take().expect("stand-in stdout");
    let ready = BufReader::new(stdout)
        .lines()
        .map_while(|line| line.ok())
        .any(|line| line.trim() == STAND_IN_READY);
    assert!(ready, "stand-in client never came up");

    let mut server = Command::new(SERVER)
        .env(ENV_SESSION, &json)
        .arg("--headless")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn bgi-server");
    let started = registry
        .open_signal(names::SERVER_STARTED)
        .expect("open started signal");
    assert!(
        started.wait_timeout(Duration::from_secs(10)),
        "server never signalled start"
    );

    kill(Pid::from_raw(client.id() as i32), Signal::SIGKILL).expect("kill client");
    let _ = client.wait();

    let status = wait_for_exit(&mut server, Duration::from_secs(3));
    assert!(status.success(), "server exited with {status}");
    assert!(registry.open_section(names::SHARED_STATE).is_err());

    registry.unlink(names::SERVER_STARTED);
    registry.unlink(names::CLIENT_ALIVE);
    let _ = fs::remove_dir_all(&dir);
}
