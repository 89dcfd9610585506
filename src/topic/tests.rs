use super::*;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn clients(subs: &[Subscription]) -> Vec<(String, QoS)> {
    let mut v: Vec<_> = subs
        .iter()
        .map(|s| (s.client_id.to_string(), s.qos))
        .collect();
    v.sort();
    v
}

#[test]
fn resubscribe_replaces_granted_qos() {
    let store = SubscriptionStore::new();
    store.subscribe(Subscription::new("c1", "a/b", QoS::AtMostOnce));
    store.subscribe(Subscription::new("c1", "a/b", QoS::ExactlyOnce));

    assert_eq!(store.count(), 1);
    assert_eq!(
        clients(&store.matches("a/b")),
        vec![("c1".to_string(), QoS::ExactlyOnce)]
    );
}

#[test]
fn overlapping_filters_deliver_once_at_highest_qos() {
    let store = SubscriptionStore::new();
    store.subscribe(Subscription::new("c1", "a/+", QoS::AtMostOnce));
    store.subscribe(Subscription::new("c1", "a/#", QoS::AtLeastOnce));
    store.subscribe(Subscription::new("c2", "a/b", QoS::ExactlyOnce));

    assert_eq!(
        clients(&store.matches("a/b")),
        vec![
            ("c1".to_string(), QoS::AtLeastOnce),
            ("c2".to_string(), QoS::ExactlyOnce)
        ]
    );
}

#[test]
fn unsubscribe_is_idempotent() {
    let store = SubscriptionStore::new();
    store.subscribe(Subscription::new("c1", "a/b", QoS::AtLeastOnce));
    store.subscribe(Subscription::new("c2", "a/b", QoS::AtLeastOnce));

    assert!(store.unsubscribe("a/b", "c1"));
    assert!(!store.unsubscribe("a/b", "c1"));
    assert!(!store.unsubscribe("x/y", "c1"));
    assert_eq!(clients(&store.matches("a/b")), vec![("c2".to_string(), QoS::AtLeastOnce)]);
}

#[test]
fn unsubscribe_all_only_touches_one_client() {
    let store = SubscriptionStore::new();
    store.subscribe(Subscription::new("c1", "a/b", QoS::AtLeastOnce));
    store.subscribe(Subscription::new("c1", "#", QoS::AtMostOnce));
    store.subscribe(Subscription::new("c2", "a/+", QoS::AtMostOnce));

    store.unsubscribe_all("c1");
    store.unsubscribe_all("c1");

    assert!(store.subscriptions_of("c1").is_empty());
    assert_eq!(store.subscriptions_of("c2").len(), 1);
    assert_eq!(clients(&store.matches("a/b")), vec![("c2".to_string(), QoS::AtMostOnce)]);
}

#[test]
fn subscriptions_of_returns_filters() {
    let store = SubscriptionStore::new();
    store.subscribe(Subscription::new("c1", "sensors/+/temp", QoS::AtLeastOnce));
    store.subscribe(Subscription::new("c1", "status/#", QoS::AtMostOnce));

    let mut filters: Vec<_> = store
        .subscriptions_of("c1")
        .into_iter()
        .map(|s| s.filter.to_string())
        .collect();
    filters.sort();
    assert_eq!(filters, vec!["sensors/+/temp", "status/#"]);
}

#[test]
fn empty_filter_matches_nothing() {
    let store = SubscriptionStore::new();
    store.subscribe(Subscription::new("c1", "", QoS::AtLeastOnce));
    assert_eq!(store.count(), 0);
    assert!(store.matches("").is_empty());
}

fn level() -> impl Strategy<Value = String> {
    prop_oneof!["[a-c]{1,2}", Just(String::new())]
}

fn topic() -> impl Strategy<Value = String> {
    prop::collection::vec(level(), 1..5).prop_map(|levels| levels.join("/"))
}

fn filter() -> impl Strategy<Value = String> {
    (
        prop::collection::vec(prop_oneof![level(), Just("+".to_string())], 0..4),
        any::<bool>(),
    )
        .prop_filter_map("empty filter", |(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            }
            if levels.is_empty() {
                None
            } else {
                Some(levels.join("/"))
            }
        })
}

proptest! {
    // The trie and the level-by-level matcher must agree on every pair
    #[test]
    fn trie_agrees_with_matcher(topic in topic(), filter in filter()) {
        prop_assume!(!topic.is_empty());
        let store = SubscriptionStore::new();
        store.subscribe(Subscription::new("c", filter.as_str(), QoS::AtMostOnce));

        let via_trie = !store.matches(&topic).is_empty();
        prop_assert_eq!(via_trie, topic_matches_filter(&topic, &filter));
    }

    #[test]
    fn plus_matches_exactly_one_level(prefix in "[a-c]{1,3}", mid in "[a-c]{1,3}", extra in "[a-c]{1,3}") {
        let filter = format!("{}/+", prefix);
        let one_level = format!("{}/{}", prefix, mid);
        let two_levels = format!("{}/{}/{}", prefix, mid, extra);
        prop_assert!(topic_matches_filter(&one_level, &filter));
        prop_assert!(!topic_matches_filter(&two_levels, &filter));
        prop_assert!(!topic_matches_filter(&prefix, &filter));
    }
}
