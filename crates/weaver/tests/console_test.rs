use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use weaver::test_utils::FakeBackend;
use weaver::{Error, HostConfig, Machine};

const TIMEOUT: Duration = Duration::from_secs(5);

fn machine(dir: &TempDir, backend: &FakeBackend, extra_serials: usize) -> Machine {
    let config = HostConfig {
        accel: None,
        ..HostConfig::default()
    }
    .with_runtime_dir(dir.path());
    Machine::builder(&config)
        .extra_serials(extra_serials)
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn login_dialogue() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new().boot_output("Debian GNU/Linux 12 debian ttyS0\r\n\r\ndebian login: ");
    let machine = machine(&dir, &backend, 0);
    machine.start().await.unwrap();
    let vm = backend.last_vm().unwrap();
    vm.on_input(0, "root\r", "Password: ");
    vm.on_input(0, "secret\r", "\r\nroot@debian:~# ");

    let console = machine.console().unwrap();
    let banner = console.expect(r"\w+ login:", TIMEOUT).await.unwrap();
    assert!(banner.before.contains("Debian GNU/Linux 12"));

    console.send_line("root").await.unwrap();
    console.expect_exact("Password:", TIMEOUT).await.unwrap();
    console.send_line("secret").await.unwrap();
    console.expect(r"root@\w+:~# $", TIMEOUT).await.unwrap();
    assert_eq!(vm.input(0), b"root\rsecret\r");

    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn control_keys_are_sent_raw() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend, 0);
    machine.start().await.unwrap();

    let console = machine.console().unwrap();
    console.send_control('c').await.unwrap();
    // Echo comes back once the fake has seen the byte.
    console.expect_exact("\u{3}", TIMEOUT).await.unwrap();
    assert_eq!(backend.last_vm().unwrap().input(0), [0x03]);

    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn extra_serial_ports_are_independent() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend, 1);
    machine.start().await.unwrap();
    let vm = backend.last_vm().unwrap();
    assert_eq!(vm.spec().serial_sockets.len(), 2);

    vm.emit(1, "agent ready\n");
    let agent = machine.serial(1).unwrap();
    assert_eq!(agent.index(), 1);
    agent.expect_exact("agent ready", TIMEOUT).await.unwrap();
    assert_eq!(machine.console().unwrap().pending(), "");

    assert!(matches!(machine.serial(2), Err(Error::InvalidConfig(_))));
    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn expect_times_out() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new().boot_output("booting\n");
    let machine = machine(&dir, &backend, 0);
    machine.start().await.unwrap();

    let console = machine.console().unwrap();
    let err = console
        .expect("login:", Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(console.pending().contains("booting"));

    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn expect_fails_once_the_machine_is_gone() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend, 0);
    machine.start().await.unwrap();
    let console = machine.console().unwrap();

    let waiter = {
        let console = console.clone();
        tokio::spawn(async move { console.expect("never printed", TIMEOUT).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    machine.terminate().await.unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::PatternNotFound { .. }), "{err}");
    assert!(console.is_closed());
}

#[tokio::test]
async fn console_output_is_logged_to_runtime_dir() {
    let dir = TempDir::new().unwrap();
    let kept = TempDir::new().unwrap();
    let backend = FakeBackend::new().boot_output("hello from the guest\n");
    let config = HostConfig {
        accel: None,
        ..HostConfig::default()
    }
    .with_runtime_dir(dir.path());
    let machine = Machine::builder(&config)
        .runtime_dir(kept.path())
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();

    machine.start().await.unwrap();
    machine
        .console()
        .unwrap()
        .expect_exact("hello", TIMEOUT)
        .await
        .unwrap();
    machine.stop().await.unwrap();

    let log = std::fs::read_to_string(kept.path().join("serial_0.log")).unwrap();
    assert!(log.contains("hello from the guest"));
}
