//! Relay replication: an object carrying both `replicate-from` and
//! `replicate-to`. The relay itself is never filled; its targets carry the
//! pull annotations and receive data straight from the upstream source.

mod common;

use common::{is_timestamp, refs, Harness};
use ditto_core::{object_key, AnnotationKeys, CHECKED_ANNOTATION};
use ditto_engine::ReplicatorOptions;

fn keys() -> AnnotationKeys {
    AnnotationKeys::default()
}

struct Case {
    name: &'static str,
    /// Whether data should reach the target while the source exists.
    replicated: bool,
    allow_all: bool,
    source_annotations: Vec<(String, String)>,
    middle_namespace: &'static str,
    middle_name: &'static str,
    middle_annotations: Vec<(String, String)>,
    target_namespace: &'static str,
    target_name: &'static str,
}

impl Case {
    fn target_key(&self) -> String {
        object_key(self.target_namespace, self.target_name)
    }
}

fn cases() -> Vec<Case> {
    let k = keys();
    let from = |v: &str| (k.replicate_from.clone(), v.to_string());
    let to = |v: &str| (k.replicate_to.clone(), v.to_string());
    let to_ns = |v: &str| (k.replicate_to_namespaces.clone(), v.to_string());
    let allowed = |v: &str| (k.replication_allowed.clone(), v.to_string());
    let allowed_ns = |v: &str| (k.replication_allowed_namespaces.clone(), v.to_string());
    let standard = || {
        vec![
            from("source-namespace/source-name"),
            to("target-namespace/target-name"),
        ]
    };
    let base = |name, replicated, allow_all, source_annotations, middle_annotations| Case {
        name,
        replicated,
        allow_all,
        source_annotations,
        middle_namespace: "middle-namespace",
        middle_name: "middle-name",
        middle_annotations,
        target_namespace: "target-namespace",
        target_name: "target-name",
    };
    let mut cases = vec![
        base("source does not allow", false, false, vec![], standard()),
        base("allow all", true, true, vec![], standard()),
        base(
            "source allows",
            true,
            false,
            vec![allowed("true")],
            standard(),
        ),
        base(
            "source allows the target namespace",
            true,
            false,
            vec![allowed_ns("target-namespace")],
            standard(),
        ),
        // permission follows the final namespace, not the relay's
        base(
            "source allows only the middle namespace",
            false,
            false,
            vec![allowed_ns("middle-namespace")],
            standard(),
        ),
    ];
    let mut same_ns = base(
        "target in the relay namespace",
        true,
        true,
        vec![],
        vec![from("source-namespace/source-name"), to("target-name")],
    );
    same_ns.target_namespace = "middle-namespace";
    cases.push(same_ns);
    let mut same_name = base(
        "target keeps the relay name",
        true,
        true,
        vec![],
        vec![
            from("source-namespace/source-name"),
            to_ns("target-namespace"),
        ],
    );
    same_name.target_name = "middle-name";
    cases.push(same_name);
    cases
}

async fn create_source(h: &mut Harness, c: &Case) {
    let source = h.new_fake(
        "source-namespace",
        "source-name",
        "source-data",
        &refs(&c.source_annotations),
    );
    h.set_add_fake(&source).await;
}

/// Re-delivers the target's own watch event after an engine-side install,
/// the way the real watch loop would.
async fn replay_target_if_changed(h: &mut Harness, c: &Case, before: Option<u64>) {
    if h.version_of(&c.target_key()) != before {
        let target = h
            .get_fake(c.target_namespace, c.target_name)
            .expect("fresh target");
        h.add_fake(&target).await;
    }
}

async fn create_middle(h: &mut Harness, c: &Case) {
    let before = h.version_of(&c.target_key());
    let middle = h.new_fake(
        c.middle_namespace,
        c.middle_name,
        "middle-data",
        &refs(&c.middle_annotations),
    );
    h.set_add_fake(&middle).await;
    replay_target_if_changed(h, c, before).await;
}

async fn create_target_namespace(h: &mut Harness, c: &Case) {
    let before = h.version_of(&c.target_key());
    h.add_namespace(c.target_namespace).await;
    replay_target_if_changed(h, c, before).await;
}

async fn verify(h: &mut Harness, c: &Case) {
    let k = keys();
    let source = h.get_fake("source-namespace", "source-name");
    let middle = h
        .get_fake(c.middle_namespace, c.middle_name)
        .expect("relay exists");
    // the relay itself is never filled
    assert_eq!(middle.data, "middle-data", "{}", c.name);
    let target = h
        .get_fake(c.target_namespace, c.target_name)
        .expect("target exists");
    let middle_key = middle.key();
    assert_eq!(
        target.annotation(&k.replicate_from),
        Some("source-namespace/source-name"),
        "{}",
        c.name
    );
    assert_eq!(
        target.annotation(&k.replicated_by),
        Some(middle_key.as_str()),
        "{}",
        c.name
    );
    if source.is_some() && c.replicated {
        let source = source.as_ref().unwrap();
        assert_eq!(target.data, "source-data", "{}", c.name);
        assert!(
            target
                .annotation(&k.replicated_at)
                .map_or(false, is_timestamp),
            "{}",
            c.name
        );
        assert_eq!(
            target.annotation(&k.replicated_version),
            Some(source.meta.resource_version.as_str()),
            "{}",
            c.name
        );
    } else {
        assert_eq!(target.data, "", "{}", c.name);
        assert!(target.annotation(&k.replicated_at).is_none(), "{}", c.name);
        assert!(
            target.annotation(&k.replicated_version).is_none(),
            "{}",
            c.name
        );
    }
    // re-delivered events must not cause further cluster calls
    let calls = h.calls();
    h.add_namespace(c.target_namespace).await;
    if let Some(source) = &source {
        h.add_fake(source).await;
    }
    h.update_add_fake(&middle, "middle-data", None).await;
    h.add_fake(&target).await;
    assert_eq!(h.calls(), calls, "{}", c.name);
}

async fn delete_source_and_verify(h: &mut Harness, c: &Case) {
    let k = keys();
    let source = h
        .get_fake("source-namespace", "source-name")
        .expect("source exists");
    let middle = h
        .get_fake(c.middle_namespace, c.middle_name)
        .expect("relay exists");
    h.unset_delete_fake(&source).await;
    // the target survives, cleared, still wired to source and relay
    let target = h
        .get_fake(c.target_namespace, c.target_name)
        .expect("target survives");
    assert_eq!(target.data, "", "{}", c.name);
    assert_eq!(
        target.annotation(&k.replicate_from),
        Some("source-namespace/source-name"),
        "{}",
        c.name
    );
    let middle_key = middle.key();
    assert_eq!(
        target.annotation(&k.replicated_by),
        Some(middle_key.as_str()),
        "{}",
        c.name
    );
    assert!(
        target.annotation(&k.replicated_version).is_none(),
        "{}",
        c.name
    );
    if c.replicated {
        assert!(
            target
                .annotation(&k.replicated_at)
                .map_or(false, is_timestamp),
            "{}",
            c.name
        );
    } else {
        assert!(target.annotation(&k.replicated_at).is_none(), "{}", c.name);
    }
    let calls = h.calls();
    h.add_namespace(c.target_namespace).await;
    h.delete_fake(&source).await;
    h.add_fake(&middle).await;
    h.add_fake(&target).await;
    assert_eq!(h.calls(), calls, "{}", c.name);
}

async fn delete_middle_and_verify(h: &mut Harness, c: &Case) {
    let source = h.get_fake("source-namespace", "source-name");
    let middle = h
        .get_fake(c.middle_namespace, c.middle_name)
        .expect("relay exists");
    let target = h
        .get_fake(c.target_namespace, c.target_name)
        .expect("target exists");
    h.unset_delete_fake(&middle).await;
    // the target follows its relay
    assert!(
        h.get_fake(c.target_namespace, c.target_name).is_none(),
        "{}",
        c.name
    );
    let calls = h.calls();
    h.add_namespace(c.target_namespace).await;
    if let Some(source) = &source {
        h.add_fake(source).await;
    }
    h.delete_fake(&middle).await;
    h.delete_fake(&target).await;
    assert_eq!(h.calls(), calls, "{}", c.name);
}

#[tokio::test]
async fn relay_event_orders() {
    for c in cases() {
        // source, relay, namespace; then lose and regain the source
        let mut h = Harness::new(c.allow_all);
        create_source(&mut h, &c).await;
        create_middle(&mut h, &c).await;
        create_target_namespace(&mut h, &c).await;
        verify(&mut h, &c).await;
        delete_source_and_verify(&mut h, &c).await;
        create_source(&mut h, &c).await;
        verify(&mut h, &c).await;

        // relay before the source; then lose and regain the relay
        let mut h = Harness::new(c.allow_all);
        create_middle(&mut h, &c).await;
        create_source(&mut h, &c).await;
        create_target_namespace(&mut h, &c).await;
        verify(&mut h, &c).await;
        delete_middle_and_verify(&mut h, &c).await;
        create_middle(&mut h, &c).await;
        verify(&mut h, &c).await;

        // relay and namespace exist before the source shows up at all
        let mut h = Harness::new(c.allow_all);
        create_middle(&mut h, &c).await;
        create_target_namespace(&mut h, &c).await;
        {
            // without a source the target exists, wired but empty
            let k = keys();
            let target = h
                .get_fake(c.target_namespace, c.target_name)
                .expect("target exists");
            assert_eq!(target.data, "", "{}", c.name);
            assert_eq!(
                target.annotation(&k.replicate_from),
                Some("source-namespace/source-name"),
                "{}",
                c.name
            );
            assert!(target.annotation(&k.replicated_version).is_none(), "{}", c.name);
        }
        create_source(&mut h, &c).await;
        verify(&mut h, &c).await;

        // namespace first
        let mut h = Harness::new(c.allow_all);
        create_target_namespace(&mut h, &c).await;
        create_middle(&mut h, &c).await;
        create_source(&mut h, &c).await;
        verify(&mut h, &c).await;
        delete_source_and_verify(&mut h, &c).await;
        create_source(&mut h, &c).await;
        verify(&mut h, &c).await;
    }
}

#[tokio::test]
async fn deprecated_annotations_are_rewritten_on_the_cluster() {
    let prefix = "test-deprecated/";
    let build = || {
        let mut keys = AnnotationKeys::with_prefix(prefix);
        keys.register_alias("deprecated-once", "replicate-once");
        let mut options = ReplicatorOptions::new("fake object");
        options.keys = keys;
        Harness::with_options(options)
    };
    let allowed = format!("{prefix}replication-allowed");
    let deprecated = format!("{prefix}deprecated-once");
    let replacement = format!("{prefix}replicate-once");
    let unknown = format!("{prefix}other-annotation");

    // recognized annotations are left alone
    let mut h = build();
    let fake = h.new_fake(
        "target-namespace",
        "target-name",
        "target-data",
        &[(allowed.as_str(), "true")],
    );
    h.set_add_fake(&fake).await;
    assert_eq!(h.calls(), 0);

    // a deprecated name is rewritten through the port exactly once
    let mut h = build();
    let fake = h.new_fake(
        "target-namespace",
        "target-name",
        "target-data",
        &[(allowed.as_str(), "true"), (deprecated.as_str(), "true")],
    );
    h.set_add_fake(&fake).await;
    assert_eq!(h.calls(), 1);
    let rewritten = h
        .get_fake("target-namespace", "target-name")
        .expect("object survives the rewrite");
    assert_eq!(rewritten.annotation(&replacement), Some("true"));
    assert_eq!(rewritten.annotation(&allowed), Some("true"));
    assert!(rewritten.annotation(&deprecated).is_none());
    // the validation memo never reaches the cluster
    let last = h.actions.state.lock().unwrap().log.last().cloned().unwrap();
    assert!(!last.annotations.contains_key(CHECKED_ANNOTATION));
    // the rewritten object needs no further work
    h.add_fake(&rewritten).await;
    assert_eq!(h.calls(), 1);

    // unknown prefixed annotations make the object inert
    let mut h = build();
    let fake = h.new_fake(
        "target-namespace",
        "target-name",
        "target-data",
        &[(allowed.as_str(), "true"), (unknown.as_str(), "true")],
    );
    h.set_add_fake(&fake).await;
    assert_eq!(h.calls(), 0);
    h.add_fake(&fake).await;
    assert_eq!(h.calls(), 0);
}
