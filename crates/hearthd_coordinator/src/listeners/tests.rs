use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use super::ListenerHandle;
use super::ListenerRegistry;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recorder(log: &Log, name: &'static str) -> impl Fn(&u32) -> anyhow::Result<()> + Send + Sync + 'static {
    let log = log.clone();
    move |_: &u32| {
        log.lock().unwrap().push(name);
        Ok(())
    }
}

#[test]
fn test_notifies_in_registration_order() {
    let registry = ListenerRegistry::<u32>::new();
    let log = Log::default();

    registry.add_listener(recorder(&log, "a"));
    registry.add_listener(recorder(&log, "b"));
    registry.add_listener(recorder(&log, "c"));

    assert_eq!(registry.notify_all(&1), 3);
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn test_remove_is_idempotent() {
    let registry = ListenerRegistry::<u32>::new();
    let log = Log::default();
    let handle = registry.add_listener(recorder(&log, "a"));

    assert!(registry.remove_listener(handle));
    assert!(!registry.remove_listener(handle));
    assert!(registry.is_empty());

    assert_eq!(registry.notify_all(&1), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_listener_removing_itself_is_not_called_again() {
    let registry = Arc::new(ListenerRegistry::<u32>::new());
    let log = Log::default();
    let own_handle: Arc<OnceLock<ListenerHandle>> = Arc::default();

    let handle = {
        let registry = Arc::downgrade(&registry);
        let own_handle = own_handle.clone();
        let log = log.clone();
        registry
            .upgrade()
            .unwrap()
            .add_listener(move |_: &u32| {
                log.lock().unwrap().push("once");
                if let (Some(registry), Some(handle)) = (registry.upgrade(), own_handle.get()) {
                    registry.remove_listener(*handle);
                }
                Ok(())
            })
    };
    own_handle.set(handle).unwrap();
    registry.add_listener(recorder(&log, "other"));

    registry.notify_all(&1);
    registry.notify_all(&2);

    assert_eq!(*log.lock().unwrap(), vec!["once", "other", "other"]);
}

#[test]
fn test_listener_removed_mid_pass_is_skipped() {
    let registry = Arc::new(ListenerRegistry::<u32>::new());
    let log = Log::default();
    let victim: Arc<OnceLock<ListenerHandle>> = Arc::default();

    {
        let weak = Arc::downgrade(&registry);
        let victim = victim.clone();
        let log = log.clone();
        registry.add_listener(move |_: &u32| {
            log.lock().unwrap().push("remover");
            if let (Some(registry), Some(handle)) = (weak.upgrade(), victim.get()) {
                registry.remove_listener(*handle);
            }
            Ok(())
        });
    }
    victim
        .set(registry.add_listener(recorder(&log, "victim")))
        .unwrap();

    assert_eq!(registry.notify_all(&1), 1);
    assert_eq!(*log.lock().unwrap(), vec!["remover"]);
}

#[test]
fn test_listener_added_mid_pass_waits_for_next_pass() {
    let registry = Arc::new(ListenerRegistry::<u32>::new());
    let log = Log::default();

    {
        let weak = Arc::downgrade(&registry);
        let log = log.clone();
        let added = Arc::new(OnceLock::new());
        registry.add_listener(move |_: &u32| {
            log.lock().unwrap().push("adder");
            if let Some(registry) = weak.upgrade() {
                added.get_or_init(|| registry.add_listener(recorder(&log, "late")));
            }
            Ok(())
        });
    }

    assert_eq!(registry.notify_all(&1), 1);
    assert_eq!(*log.lock().unwrap(), vec!["adder"]);

    assert_eq!(registry.notify_all(&2), 2);
    assert_eq!(*log.lock().unwrap(), vec!["adder", "adder", "late"]);
}

#[test]
fn test_failing_listeners_do_not_stop_the_pass() {
    let registry = ListenerRegistry::<u32>::new();
    let log = Log::default();

    registry.add_listener(|_: &u32| Err(anyhow::anyhow!("entity gone")));
    registry.add_listener(|_: &u32| panic!("listener bug"));
    registry.add_listener(recorder(&log, "survivor"));

    assert_eq!(registry.notify_all(&1), 3);
    assert_eq!(*log.lock().unwrap(), vec!["survivor"]);

    // Still registered and still isolated on the next pass.
    assert_eq!(registry.notify_all(&2), 3);
    assert_eq!(registry.len(), 3);
}

#[tokio::test]
async fn test_subscription_receives_events_until_dropped() {
    let registry = ListenerRegistry::<u32>::new();
    let mut subscription = registry.subscribe();
    assert_eq!(registry.len(), 1);

    registry.notify_all(&10);
    registry.notify_all(&11);
    assert_eq!(subscription.recv().await, Some(10));
    assert_eq!(subscription.try_recv(), Some(11));
    assert_eq!(subscription.try_recv(), None);

    drop(subscription);
    assert!(registry.is_empty());
    assert_eq!(registry.notify_all(&12), 0);
}

#[tokio::test]
async fn test_subscription_ends_with_registry() {
    let registry = ListenerRegistry::<u32>::new();
    let mut subscription = registry.subscribe();

    registry.notify_all(&1);
    drop(registry);

    assert_eq!(subscription.recv().await, Some(1));
    assert_eq!(subscription.recv().await, None);
}
