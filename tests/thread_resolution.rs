use std::collections::HashMap;

use mailweave::threading::{resolve_thread, Resolution};

fn known(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(m, t)| (m.to_string(), t.to_string()))
        .collect()
}

fn refs(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn in_reply_to_wins_over_references() {
    let store = known(&[("<parent@x>", "t-parent"), ("<root@x>", "t-root")]);
    let resolution = resolve_thread(Some("<parent@x>"), &refs(&["<root@x>"]), |id| {
        store.get(id).cloned()
    });
    assert_eq!(resolution, Resolution::Existing("t-parent".into()));
}

#[test]
fn first_known_reference_is_used_when_parent_is_unknown() {
    let store = known(&[("<b@x>", "t-b"), ("<c@x>", "t-c")]);
    let resolution = resolve_thread(
        Some("<missing@x>"),
        &refs(&["<a@x>", "<b@x>", "<c@x>"]),
        |id| store.get(id).cloned(),
    );
    assert_eq!(resolution.thread_id(), "t-b");
    assert!(matches!(resolution, Resolution::Existing(_)));
}

#[test]
fn unknown_ancestry_opens_a_new_thread() {
    let store: HashMap<String, String> = HashMap::new();
    let first = resolve_thread(Some("<nobody@x>"), &refs(&["<gone@x>"]), |id| {
        store.get(id).cloned()
    });
    let second = resolve_thread(None, &[], |id| store.get(id).cloned());

    assert!(matches!(first, Resolution::New(_)));
    assert!(matches!(second, Resolution::New(_)));
    assert_ne!(first.thread_id(), second.thread_id());
    assert!(!first.thread_id().is_empty());
}
