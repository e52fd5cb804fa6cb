//! End-to-end tests that drive the compiled binary as a real OS process over
//! real sockets, matching the grounding daemon crate's own integration style.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gracefuld"))
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn spawn_server(bind: &str, pid_path: &std::path::Path) -> Child {
    Command::new(binary_path())
        .arg("run")
        .arg("--bind")
        .arg(bind)
        .arg("--pid-path")
        .arg(pid_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn gracefuld")
}

fn is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn send_sigterm(pid: i32) {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM).unwrap();
}

fn read_pid(path: &std::path::Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[test]
fn idle_graceful_stop_exits_quickly_and_removes_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("idle.pid");
    let mut child = spawn_server("tcp://127.0.0.1:17890", &pid_path);

    assert!(wait_for(Duration::from_secs(2), || pid_path.exists()));
    let pid = child.id() as i32;

    send_sigterm(pid);
    let exited = wait_for(Duration::from_millis(500), || !is_alive(pid));
    assert!(exited, "process should exit quickly with no open connections");
    assert!(!pid_path.exists(), "pid file must be removed on clean shutdown");

    let _ = child.wait();
}

#[test]
fn graceful_stop_waits_for_active_connection() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("drain.pid");
    let mut child = spawn_server("tcp://127.0.0.1:17891", &pid_path);
    assert!(wait_for(Duration::from_secs(2), || pid_path.exists()));
    let pid = child.id() as i32;

    let mut stream = TcpStream::connect("127.0.0.1:17891").unwrap();

    send_sigterm(pid);
    std::thread::sleep(Duration::from_millis(100));
    assert!(is_alive(pid), "process must stay up while a connection is open");

    stream.write_all(b"hello world!\n").unwrap();
    let mut buf = [0u8; 13];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello world!\n");
    drop(stream);

    let exited = wait_for(Duration::from_secs(2), || !is_alive(pid));
    assert!(exited, "process should exit once the connection closes");

    let _ = child.wait();
}

#[test]
fn second_sigterm_forces_immediate_exit() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("force.pid");
    let mut child = spawn_server("tcp://127.0.0.1:17892", &pid_path);
    assert!(wait_for(Duration::from_secs(2), || pid_path.exists()));
    let pid = child.id() as i32;

    let stream = TcpStream::connect("127.0.0.1:17892").unwrap();

    send_sigterm(pid);
    std::thread::sleep(Duration::from_millis(100));
    send_sigterm(pid);

    let exited = wait_for(Duration::from_millis(500), || !is_alive(pid));
    assert!(exited, "a second SIGTERM must force an immediate exit");
    drop(stream);

    let _ = child.wait();
}

#[test]
fn graceful_restart_hands_off_pid_and_listener() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("restart.pid");
    let mut child = spawn_server("tcp://127.0.0.1:17893", &pid_path);
    assert!(wait_for(Duration::from_secs(2), || pid_path.exists()));
    let predecessor_pid = child.id() as i32;

    nix::sys::signal::kill(nix::unistd::Pid::from_raw(predecessor_pid), nix::sys::signal::Signal::SIGUSR1).unwrap();

    let handed_off = wait_for(Duration::from_secs(5), || {
        read_pid(&pid_path).map(|p| p != predecessor_pid).unwrap_or(false)
    });
    assert!(handed_off, "pid file should show a new pid within the handover window");

    let successor_pid = read_pid(&pid_path).unwrap();
    assert!(is_alive(successor_pid));

    let predecessor_exited = wait_for(Duration::from_secs(2), || !is_alive(predecessor_pid));
    assert!(predecessor_exited, "predecessor should drain and exit after handing off");

    let mut stream = TcpStream::connect("127.0.0.1:17893").unwrap();
    stream.write_all(b"still here\n").unwrap();
    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"still here\n");

    send_sigterm(successor_pid);
    let _ = child.wait();
}

#[test]
fn unix_socket_echo_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("echo.sock");
    let pid_path = dir.path().join("unix.pid");
    let bind = format!("unix://{}", socket_path.display());
    let mut child = spawn_server(&bind, &pid_path);
    assert!(wait_for(Duration::from_secs(2), || socket_path.exists()));

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    stream.write_all(b"hello world!\n").unwrap();
    let mut buf = [0u8; 13];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello world!\n");
    drop(stream);

    let pid = child.id() as i32;
    send_sigterm(pid);
    let _ = child.wait();
}
