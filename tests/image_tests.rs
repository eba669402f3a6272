mod test_harness;

use chrono::Duration;

use fleet_broker::clock::Clock;
use fleet_broker::images::ImageCleaner;
use test_harness::{FakeBroker, FakeRuntime, TestNode};

#[tokio::test]
async fn test_sweep_removes_only_expired_images_this_node_used() {
    let runtime = FakeRuntime::new()
        .with_image("sha256:old", "alpine", "3.18")
        .with_image("sha256:new", "busybox", "latest")
        .with_image("sha256:foreign", "postgres", "16");
    let node = TestNode::new(FakeBroker::new(), runtime);
    let now = node.clock.now();
    node.ctx.images.mark_used("sha256:old", now - Duration::hours(25));
    node.ctx.images.mark_used("busybox:latest", now - Duration::hours(1));

    let removed = ImageCleaner::new(node.ctx.clone()).sweep().await.unwrap();

    assert_eq!(removed, vec!["sha256:old"]);
    assert_eq!(node.runtime.removed_images(), vec!["sha256:old"]);
    assert_eq!(node.runtime.image_ids(), vec!["sha256:new", "sha256:foreign"]);
    assert!(node.ctx.images.last_used("sha256:old").is_none());
    assert!(node.ctx.images.last_used("busybox:latest").is_some());
}

#[tokio::test]
async fn test_image_expires_as_clock_moves() {
    let runtime = FakeRuntime::new().with_image("sha256:a1", "alpine", "latest");
    let node = TestNode::new(FakeBroker::new(), runtime);
    node.ctx.images.mark_used("sha256:a1", node.clock.now());
    let cleaner = ImageCleaner::new(node.ctx.clone());

    assert!(cleaner.sweep().await.unwrap().is_empty());

    node.clock.advance(Duration::hours(24) + Duration::seconds(1));
    assert_eq!(cleaner.sweep().await.unwrap(), vec!["sha256:a1"]);
    assert!(node.ctx.images.is_empty());
}
