use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use weaver::test_utils::FakeBackend;
use weaver::{Adapter, Drive, Error, HostConfig, ImageFormat, Machine, MachineState, Network};
use weaver_net::testing::MemoryHost;

fn config(dir: &TempDir) -> HostConfig {
    HostConfig {
        accel: None,
        connect_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(5),
        ..HostConfig::default()
    }
    .with_runtime_dir(dir.path())
}

fn machine(dir: &TempDir, backend: &FakeBackend) -> Machine {
    Machine::builder(&config(dir))
        .cpus(2)
        .memory_mib(4096)
        .backend(Arc::new(backend.clone()))
        .host_networking(Arc::new(MemoryHost::new()))
        .build()
        .unwrap()
}

fn leftover_entries(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}

#[tokio::test]
async fn start_and_stop_gracefully() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);

    machine.start().await.unwrap();
    assert_eq!(machine.state(), MachineState::Running);
    let vm = backend.last_vm().unwrap();
    assert_eq!(vm.spec().resources.cpus, 2);
    assert_eq!(vm.spec().resources.memory_mib, 4096);
    assert_eq!(vm.spec().serial_sockets.len(), 1);
    assert!(vm.commands().contains(&"qmp_capabilities".to_string()));

    machine.stop().await.unwrap();
    assert_eq!(machine.state(), MachineState::Stopped);
    assert!(vm.commands().contains(&"system_powerdown".to_string()));
    assert_eq!(machine.last_exit().unwrap().code, Some(0));
    assert!(vm.signals().is_empty());
    assert!(!machine.is_crashed());
    assert_eq!(leftover_entries(&dir), 0);

    machine.stop().await.unwrap();
    assert_eq!(backend.vms().len(), 1);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);

    machine.start().await.unwrap();
    let err = machine.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { operation: "start", .. }));
    assert_eq!(backend.vms().len(), 1);
    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn machine_can_be_restarted() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);

    machine.start().await.unwrap();
    machine.terminate().await.unwrap();
    machine.start().await.unwrap();
    assert_eq!(machine.state(), MachineState::Running);
    assert_eq!(backend.vms().len(), 2);
    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn stop_escalates_when_guest_ignores_powerdown() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new().ignore_powerdown();
    let mut config = config(&dir);
    config.shutdown_timeout = Duration::from_millis(200);
    let machine = Machine::builder(&config)
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();

    machine.start().await.unwrap();
    machine.stop().await.unwrap();
    let vm = backend.last_vm().unwrap();
    assert_eq!(vm.signals().first(), Some(&"SIGTERM"));
    assert!(vm.has_exited());
    assert_eq!(machine.state(), MachineState::Stopped);
}

#[tokio::test]
async fn terminate_kills_without_powerdown() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);

    machine.start().await.unwrap();
    machine.terminate().await.unwrap();
    let vm = backend.last_vm().unwrap();
    assert_eq!(vm.signals(), ["SIGKILL"]);
    assert!(!vm.commands().contains(&"system_powerdown".to_string()));
    assert_eq!(machine.state(), MachineState::Stopped);
    assert_eq!(leftover_entries(&dir), 0);
}

#[tokio::test]
async fn pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);
    machine.start().await.unwrap();
    let vm = backend.last_vm().unwrap();

    machine.pause().await.unwrap();
    assert_eq!(machine.state(), MachineState::Paused);
    assert!(!vm.is_guest_running());
    let status = machine.query_status().await.unwrap();
    assert_eq!(status.status, "paused");
    assert!(!status.running);

    let err = machine.pause().await.unwrap_err();
    assert_eq!(err.to_string(), "cannot pause while machine is paused");

    machine.resume().await.unwrap();
    assert_eq!(machine.state(), MachineState::Running);
    assert!(machine.query_status().await.unwrap().running);
    assert!(matches!(
        machine.resume().await,
        Err(Error::InvalidState { .. })
    ));

    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn stopping_a_paused_machine_quits() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);
    machine.start().await.unwrap();
    machine.pause().await.unwrap();

    machine.stop().await.unwrap();
    let vm = backend.last_vm().unwrap();
    assert_eq!(vm.commands().last().map(String::as_str), Some("quit"));
    assert_eq!(machine.last_exit().unwrap().code, Some(0));
}

#[tokio::test]
async fn crash_surfaces_on_next_operation() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);
    machine.start().await.unwrap();
    let console = machine.console().unwrap();

    backend.last_vm().unwrap().crash(3);
    let err = machine.take_snapshot("boot").await.unwrap_err();
    assert!(matches!(err, Error::ProcessExited { exit_code: Some(3) }));
    assert_eq!(machine.state(), MachineState::Stopped);
    assert!(machine.is_crashed());
    assert_eq!(machine.last_exit().unwrap().code, Some(3));
    assert!(console.is_closed());
    assert!(machine.console().is_err());
    assert_eq!(leftover_entries(&dir), 0);

    // Already cleaned up.
    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn lost_control_channel_stops_the_machine() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);
    machine.start().await.unwrap();
    let vm = backend.last_vm().unwrap();

    vm.drop_control();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = machine.pause().await.unwrap_err();
    assert!(err.is_process_exit());
    assert!(vm.has_exited());
    assert_eq!(vm.signals(), ["SIGKILL"]);
    assert_eq!(machine.state(), MachineState::Stopped);
    assert!(machine.is_crashed());
}

#[tokio::test]
async fn startup_failure_reports_exit_and_log() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let backend = FakeBackend::new().exit_on_start(1);
    let machine = Machine::builder(&config(&dir))
        .adapter(Adapter::parse("52:54:00:00:40:01").unwrap())
        .backend(Arc::new(backend.clone()))
        .host_networking(host.clone())
        .build()
        .unwrap();

    let err = machine.start().await.unwrap_err();
    let Error::StartupFailed(message) = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(message.contains("Some(1)"), "{message}");
    assert!(message.contains("Permission denied"), "{message}");
    assert_eq!(machine.state(), MachineState::Stopped);
    assert!(!host.has_link("wvp-004001"));
    assert!(!host.has_link("wvt-004001"));
}

#[tokio::test]
async fn unreachable_sockets_time_out() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new().never_listen();
    let mut config = config(&dir);
    config.connect_timeout = Duration::from_millis(300);
    let machine = Machine::builder(&config)
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();

    let err = machine.start().await.unwrap_err();
    assert!(matches!(err, Error::StartupFailed(_)), "{err}");
    let vm = backend.last_vm().unwrap();
    assert!(vm.has_exited());
    assert_eq!(vm.signals(), ["SIGKILL"]);
    assert_eq!(machine.state(), MachineState::Stopped);
}

#[tokio::test]
async fn overlay_failure_aborts_start() {
    let dir = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();
    let disk = images.path().join("root.qcow2");
    std::fs::write(&disk, b"").unwrap();
    let backend = FakeBackend::new().fail_overlay("qemu-img: backing file unreadable");

    let machine = Machine::builder(&config(&dir))
        .drive(Drive::new(&disk).unwrap())
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();
    let err = machine.start().await.unwrap_err();
    assert!(err.to_string().contains("backing file unreadable"));
    assert!(backend.vms().is_empty());
}

#[tokio::test]
async fn ephemeral_disks_get_overlays() {
    let dir = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();
    let disk = images.path().join("root.raw");
    let seed = images.path().join("seed.iso");
    std::fs::write(&disk, b"").unwrap();
    std::fs::write(&seed, b"").unwrap();
    let backend = FakeBackend::new();

    let machine = Machine::builder(&config(&dir))
        .drive(Drive::new(&disk).unwrap())
        .drive(Drive::new(&seed).unwrap().read_only())
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();
    machine.start().await.unwrap();

    let overlays = backend.overlays();
    assert_eq!(overlays.len(), 1);
    assert_eq!(overlays[0].0, disk);

    let vm = backend.last_vm().unwrap();
    let drives = &vm.spec().drives;
    assert_eq!(drives[0].file, overlays[0].1);
    assert_eq!(drives[0].format, ImageFormat::Qcow2);
    assert_eq!(drives[1].file, seed);
    assert!(drives[1].read_only);

    machine.terminate().await.unwrap();
    assert!(!overlays[0].1.exists());
    assert!(disk.exists());
}

#[tokio::test]
async fn persistent_disks_are_attached_directly() {
    let dir = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();
    let disk = images.path().join("root.qcow2");
    std::fs::write(&disk, b"").unwrap();
    let backend = FakeBackend::new();

    let machine = Machine::builder(&config(&dir))
        .drive(Drive::new(&disk).unwrap())
        .ephemeral(false)
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();
    machine.start().await.unwrap();
    assert!(backend.overlays().is_empty());
    assert_eq!(backend.last_vm().unwrap().spec().drives[0].file, disk);
    machine.terminate().await.unwrap();
}

#[tokio::test]
async fn kept_runtime_dir_survives_stop() {
    let dir = TempDir::new().unwrap();
    let kept = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = Machine::builder(&config(&dir))
        .runtime_dir(kept.path())
        .backend(Arc::new(backend.clone()))
        .build()
        .unwrap();

    machine.start().await.unwrap();
    assert_eq!(
        backend.last_vm().unwrap().spec().control_socket,
        kept.path().join("qmp.sock")
    );
    machine.stop().await.unwrap();

    assert!(kept.path().join("vmm.log").exists());
    assert!(kept.path().join("serial_0.log").exists());
    assert!(!kept.path().join("qmp.sock").exists());
    assert!(!kept.path().join("serial0.sock").exists());
}

#[tokio::test]
async fn adapters_get_host_ports_while_running() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let backend = FakeBackend::new();
    let adapter = Adapter::parse("52:54:00:00:40:02").unwrap();
    let machine = Machine::builder(&config(&dir))
        .adapter(adapter.clone())
        .backend(Arc::new(backend.clone()))
        .host_networking(host.clone())
        .build()
        .unwrap();

    machine.start().await.unwrap();
    assert!(host.has_link("wvp-004002"));
    assert_eq!(
        host.link("wvt-004002").unwrap().master.as_deref(),
        Some("wvp-004002")
    );
    let vm = backend.last_vm().unwrap();
    let nics = &vm.spec().nics;
    assert_eq!(nics.len(), 1);
    assert_eq!(nics[0].tap, "wvt-004002");
    assert_eq!(nics[0].mac, adapter.mac());

    machine.stop().await.unwrap();
    assert!(!host.has_link("wvp-004002"));
    assert!(!host.has_link("wvt-004002"));
}

#[tokio::test]
async fn network_and_machine_share_the_adapter_port() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let config = config(&dir);
    let adapter = Adapter::parse("52:54:00:00:40:03").unwrap();
    let machine = Machine::builder(&config)
        .adapter(adapter.clone())
        .backend(Arc::new(FakeBackend::new()))
        .host_networking(host.clone())
        .build()
        .unwrap();
    let network = Network::switch(host.clone(), &config).await.unwrap();

    machine.start().await.unwrap();
    network.add_adapter(&adapter).await.unwrap();
    assert_eq!(adapter.network_id(), Some(network.id()));

    machine.terminate().await.unwrap();
    assert!(host.has_link("wvp-004003"), "network still holds the port");

    network.teardown().await.unwrap();
    assert!(!host.has_link("wvp-004003"));
    assert!(!host.has_link("wvt-004003"));
}

#[tokio::test]
async fn run_terminates_after_body() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);

    let state = machine
        .run(async |m| Ok(m.state()))
        .await
        .unwrap();
    assert_eq!(state, MachineState::Running);
    let vm = backend.last_vm().unwrap();
    assert!(vm.has_exited());
    assert_eq!(leftover_entries(&dir), 0);
}

#[tokio::test]
async fn run_reports_body_error_and_still_cleans_up() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let machine = machine(&dir, &backend);

    let err = machine
        .run(async |m| {
            m.revert_snapshot("missing").await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Snapshot { .. }));
    assert!(backend.last_vm().unwrap().has_exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_a_running_machine_cleans_up() {
    let dir = TempDir::new().unwrap();
    let host = Arc::new(MemoryHost::new());
    let backend = FakeBackend::new();
    let machine = Machine::builder(&config(&dir))
        .adapter(Adapter::parse("52:54:00:00:40:04").unwrap())
        .backend(Arc::new(backend.clone()))
        .host_networking(host.clone())
        .build()
        .unwrap();

    machine.start().await.unwrap();
    assert!(host.has_link("wvt-004004"));
    drop(machine);

    assert!(backend.last_vm().unwrap().has_exited());
    assert!(!host.has_link("wvt-004004"));
    assert!(!host.has_link("wvp-004004"));
    assert_eq!(leftover_entries(&dir), 0);
}
