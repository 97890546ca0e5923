use super::*;
use crate::config::ServiceConfig;
use crate::events::{EventBus, ServiceEvent};
use crate::test_support::FakeProber;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

const FORMATS_OUTPUT: &str = "ioctl: VIDIOC_ENUM_FMT
	Type: Video Capture

	[0]: 'MJPG' (Motion-JPEG, compressed)
		Size: Discrete 1280x720
			Interval: Discrete 0.033s (30.000 fps)
			Interval: Discrete 0.067s (15.000 fps)
		Size: Discrete 1920x1080
			Interval: Discrete 0.033s (30.000 fps)
	[1]: 'YUYV' (YUYV 4:2:2)
		Size: Discrete 640x480
			Interval: Discrete 0.017s (60.000 fps)
";

fn create_monitor(
    device_dir: &TempDir,
    prober: FakeProber,
    enable_hotplug: bool,
) -> (CameraMonitor, Arc<EventBus>) {
    let mut config = ServiceConfig::default();
    config.camera.device_dir = device_dir.path().to_string_lossy().into_owned();
    config.camera.enable_hotplug = enable_hotplug;
    config.camera.poll_interval_seconds = 1;

    let event_bus = Arc::new(EventBus::new(32));
    let monitor = CameraMonitor::new(
        config.camera,
        config.mediamtx,
        Arc::new(prober),
        Arc::clone(&event_bus),
    );
    (monitor, event_bus)
}

fn touch(dir: &TempDir, name: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, b"").unwrap();
    path.to_string_lossy().into_owned()
}

async fn next_event(receiver: &mut broadcast::Receiver<ServiceEvent>) -> ServiceEvent {
    timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for camera event")
        .unwrap()
}

#[test]
fn test_device_identifiers() {
    assert_eq!(video_index("video0"), Some(0));
    assert_eq!(video_index("video12"), Some(12));
    assert_eq!(video_index("video"), None);
    assert_eq!(video_index("vide0"), None);
    assert_eq!(video_index("video1a"), None);

    assert_eq!(camera_id_for_path("/dev/video3"), "camera3");
    assert_eq!(
        resolve_device_path("camera3", "/dev").as_deref(),
        Some("/dev/video3")
    );
    assert_eq!(
        resolve_device_path("video2", "/dev").as_deref(),
        Some("/dev/video2")
    );
    assert_eq!(
        resolve_device_path("/dev/video0", "/dev").as_deref(),
        Some("/dev/video0")
    );
    assert_eq!(resolve_device_path("cameraX", "/dev"), None);
    assert_eq!(resolve_device_path("", "/dev"), None);
}

#[test]
fn test_parse_formats_ext() {
    let capabilities = parse_formats_ext(FORMATS_OUTPUT);

    assert_eq!(capabilities.formats, vec!["MJPG", "YUYV"]);
    assert_eq!(
        capabilities.resolutions,
        vec!["1920x1080", "1280x720", "640x480"]
    );
    assert_eq!(capabilities.frame_rates, vec![60, 30, 15]);
    assert_eq!(capabilities.best_resolution(), Some("1920x1080"));
    assert!(capabilities.supports_resolution("640x480"));
    assert!(capabilities.probed);
}

#[test]
fn test_parse_formats_ext_without_capture_formats() {
    let capabilities = parse_formats_ext("ioctl: VIDIOC_ENUM_FMT\n\tType: Video Capture\n");
    assert!(capabilities.formats.is_empty());
    assert!(capabilities.resolutions.is_empty());
}

#[tokio::test]
async fn test_v4l2_prober_falls_back_without_tool() {
    let mut config = ServiceConfig::default();
    config.camera.v4l2_ctl_path = "/nonexistent/v4l2-ctl".to_string();
    let prober = V4l2Prober::new(&config.camera);

    let result = prober.probe("/dev/video0").await.unwrap();
    assert!(!result.name.is_empty());
    assert!(!result.capabilities.probed);
    assert_eq!(result.capabilities.best_resolution(), Some("1920x1080"));
    assert_eq!(result.capabilities.max_fps(), Some(30));
}

#[tokio::test]
async fn test_initial_scan_registers_video_nodes() {
    let dir = TempDir::new().unwrap();
    touch(&dir, "video0");
    touch(&dir, "video1");
    touch(&dir, "video42");
    touch(&dir, "null");

    let (monitor, _bus) = create_monitor(&dir, FakeProber::default(), false);
    monitor.start().await.unwrap();

    let cameras = monitor.get_connected_cameras();
    assert_eq!(cameras.len(), 2);

    let camera = monitor.get_camera("camera0").unwrap();
    assert_eq!(camera.status, CameraStatus::Connected);
    assert_eq!(camera.resolution, "1920x1080");
    assert_eq!(camera.fps, 30);
    assert!(camera.stream_urls.rtsp.ends_with(":8554/camera0"));
    assert!(monitor.get_camera("camera42").is_none());
    assert_eq!(monitor.mode(), MonitorMode::Polling);

    monitor.stop().await.unwrap();
    assert_eq!(monitor.mode(), MonitorMode::Stopped);
}

#[tokio::test]
async fn test_get_connected_cameras_is_side_effect_free() {
    let dir = TempDir::new().unwrap();
    touch(&dir, "video0");

    let (monitor, _bus) = create_monitor(&dir, FakeProber::default(), false);
    monitor.start().await.unwrap();

    let first = monitor.get_connected_cameras();
    let second = monitor.get_connected_cameras();
    assert_eq!(first.len(), second.len());
    assert_eq!(
        first.get(&touch_path(&dir, "video0")).map(|c| c.connected_at),
        second.get(&touch_path(&dir, "video0")).map(|c| c.connected_at)
    );

    monitor.stop().await.unwrap();
}

fn touch_path(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_missing_device_directory_yields_empty_inventory() {
    let dir = TempDir::new().unwrap();
    let mut config = ServiceConfig::default();
    config.camera.device_dir = dir
        .path()
        .join("does-not-exist")
        .to_string_lossy()
        .into_owned();
    config.camera.enable_hotplug = true;

    let monitor = CameraMonitor::new(
        config.camera,
        config.mediamtx,
        Arc::new(FakeProber::default()),
        Arc::new(EventBus::new(8)),
    );

    monitor.start().await.unwrap();
    assert!(monitor.get_connected_cameras().is_empty());
    assert_eq!(monitor.mode(), MonitorMode::Unavailable);
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_attach_then_detach_publishes_events() {
    let dir = TempDir::new().unwrap();
    let (monitor, bus) = create_monitor(&dir, FakeProber::default(), false);
    let mut receiver = bus.subscribe();

    let path = touch(&dir, "video2");
    let camera = monitor.attach_device(&path).await.unwrap();
    assert_eq!(camera.camera_id, "camera2");

    match next_event(&mut receiver).await {
        ServiceEvent::CameraConnected { camera } => assert_eq!(camera.device_path, path),
        other => panic!("Unexpected event: {:?}", other),
    }

    // Second attach of a known node is a no-op
    assert!(monitor.attach_device(&path).await.is_none());

    assert!(monitor.detach_device(&path).await);
    match next_event(&mut receiver).await {
        ServiceEvent::CameraDisconnected { camera_id, .. } => assert_eq!(camera_id, "camera2"),
        other => panic!("Unexpected event: {:?}", other),
    }
    assert!(monitor.get_camera("camera2").is_none());
    assert!(!monitor.detach_device(&path).await);
}

#[tokio::test]
async fn test_probe_failure_leaves_node_out_of_inventory() {
    let dir = TempDir::new().unwrap();
    touch(&dir, "video0");
    let metadata_node = touch(&dir, "video1");

    let prober = FakeProber::default().failing_on(&metadata_node);
    let (monitor, _bus) = create_monitor(&dir, prober, false);
    monitor.start().await.unwrap();

    assert_eq!(monitor.camera_count(), 1);
    assert!(monitor.get_camera("camera1").is_none());
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_detach_during_probe_discards_result() {
    let dir = TempDir::new().unwrap();
    let path = touch(&dir, "video0");
    let prober = FakeProber::default().with_delay(Duration::from_millis(300));
    let (monitor, bus) = create_monitor(&dir, prober, false);
    let mut receiver = bus.subscribe();

    let attaching = {
        let monitor = monitor.clone();
        let path = path.clone();
        tokio::spawn(async move { monitor.attach_device(&path).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Never reached CONNECTED, so nothing to announce
    assert!(!monitor.detach_device(&path).await);

    assert!(attaching.await.unwrap().is_none());
    assert!(monitor.get_connected_cameras().is_empty());
    assert!(receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_polling_detects_hotplug() {
    let dir = TempDir::new().unwrap();
    let (monitor, bus) = create_monitor(&dir, FakeProber::default(), false);
    let mut receiver = bus.subscribe();
    monitor.start().await.unwrap();
    assert!(monitor.get_connected_cameras().is_empty());

    let path = touch(&dir, "video3");
    match next_event(&mut receiver).await {
        ServiceEvent::CameraConnected { camera } => assert_eq!(camera.device_path, path),
        other => panic!("Unexpected event: {:?}", other),
    }

    std::fs::remove_file(&path).unwrap();
    match next_event(&mut receiver).await {
        ServiceEvent::CameraDisconnected { device_path, .. } => assert_eq!(device_path, path),
        other => panic!("Unexpected event: {:?}", other),
    }

    monitor.stop().await.unwrap();
}

#[cfg(feature = "hotplug")]
#[tokio::test]
async fn test_watcher_detects_hotplug() {
    let dir = TempDir::new().unwrap();
    let (monitor, bus) = create_monitor(&dir, FakeProber::default(), true);
    let mut receiver = bus.subscribe();
    monitor.start().await.unwrap();
    assert_eq!(monitor.mode(), MonitorMode::Hotplug);

    let path = touch(&dir, "video5");
    match next_event(&mut receiver).await {
        ServiceEvent::CameraConnected { camera } => assert_eq!(camera.device_path, path),
        other => panic!("Unexpected event: {:?}", other),
    }

    std::fs::remove_file(&path).unwrap();
    match next_event(&mut receiver).await {
        ServiceEvent::CameraDisconnected { camera_id, .. } => assert_eq!(camera_id, "camera5"),
        other => panic!("Unexpected event: {:?}", other),
    }

    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_node_removed_during_probe_is_not_registered() {
    let dir = TempDir::new().unwrap();
    let path = touch(&dir, "video6");
    let prober = FakeProber::default().with_delay(Duration::from_millis(300));
    let (monitor, bus) = create_monitor(&dir, prober, false);
    let mut receiver = bus.subscribe();

    let attaching = {
        let monitor = monitor.clone();
        let path = path.clone();
        tokio::spawn(async move { monitor.attach_device(&path).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::remove_file(&path).unwrap();

    assert!(attaching.await.unwrap().is_none());
    assert!(monitor.get_connected_cameras().is_empty());
    assert!(receiver.try_recv().is_err());

    // The node can be attached again once it comes back
    touch(&dir, "video6");
    assert!(monitor.attach_device(&path).await.is_some());
}

#[cfg(feature = "hotplug")]
#[tokio::test]
async fn test_watcher_ignores_node_removed_while_settling() {
    let dir = TempDir::new().unwrap();
    let (monitor, bus) = create_monitor(&dir, FakeProber::default(), true);
    let mut receiver = bus.subscribe();
    monitor.start().await.unwrap();
    assert_eq!(monitor.mode(), MonitorMode::Hotplug);

    let path = touch(&dir, "video7");
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::remove_file(&path).unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(monitor.get_connected_cameras().is_empty());
    assert!(receiver.try_recv().is_err());
    monitor.stop().await.unwrap();
}

#[tokio::test]
async fn test_polling_picks_up_late_device_directory() {
    let dir = TempDir::new().unwrap();
    let device_dir = dir.path().join("dev");
    let mut config = ServiceConfig::default();
    config.camera.device_dir = device_dir.to_string_lossy().into_owned();
    config.camera.enable_hotplug = false;
    config.camera.poll_interval_seconds = 1;

    let bus = Arc::new(EventBus::new(8));
    let mut receiver = bus.subscribe();
    let monitor = CameraMonitor::new(
        config.camera,
        config.mediamtx,
        Arc::new(FakeProber::default()),
        Arc::clone(&bus),
    );

    monitor.start().await.unwrap();
    assert_eq!(monitor.mode(), MonitorMode::Unavailable);

    std::fs::create_dir_all(&device_dir).unwrap();
    std::fs::write(device_dir.join("video0"), b"").unwrap();

    match next_event(&mut receiver).await {
        ServiceEvent::CameraConnected { camera } => assert_eq!(camera.camera_id, "camera0"),
        other => panic!("Unexpected event: {:?}", other),
    }
    assert_eq!(monitor.mode(), MonitorMode::Polling);
    assert_eq!(monitor.camera_count(), 1);

    monitor.stop().await.unwrap();
}
