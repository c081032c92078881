mod helpers;

use helpers::test_memory;
use hindsight::memory::recall::{RecallMode, RecallOptions, RecallResponse};
use hindsight::memory::retain::{FactInput, MentionInput, RetainOptions};
use hindsight::memory::types::FactType;

fn fact(content: &str, fact_type: FactType) -> FactInput {
    FactInput {
        content: content.to_string(),
        fact_type,
        confidence: 0.9,
        occurred_start: None,
        occurred_end: None,
        mentioned_at: None,
        entities: Vec::new(),
    }
}

#[test]
fn retain_recall_round_trip_across_methods() {
    let engine = test_memory();
    engine
        .retain(
            "default",
            &[
                fact("the payment service retries idempotently", FactType::World),
                fact("the payments migration finished last sprint", FactType::Experience),
            ],
            &RetainOptions::default(),
        )
        .unwrap();

    let response = engine
        .recall("default", "payment retries", &RecallOptions::default())
        .unwrap();
    assert!(!response.memories.is_empty());
    assert!(response.memories[0]
        .memory
        .content
        .contains("payment service"));
}

#[test]
fn rrf_ordering_is_reproducible() {
    let engine = test_memory();
    engine
        .retain(
            "default",
            &[
                fact("observability dashboards live in grafana", FactType::World),
                fact("grafana alerts page the on-call rotation", FactType::World),
                fact("the on-call rotation changes on tuesdays", FactType::World),
            ],
            &RetainOptions::default(),
        )
        .unwrap();

    let snapshot = |r: &RecallResponse| -> Vec<(String, String)> {
        r.memories
            .iter()
            .map(|m| (m.memory.id.clone(), format!("{:.9}", m.score)))
            .collect()
    };

    let opts = RecallOptions::default();
    let first = engine.recall("default", "grafana on-call", &opts).unwrap();
    let second = engine.recall("default", "grafana on-call", &opts).unwrap();
    assert_eq!(snapshot(&first), snapshot(&second));
}

#[test]
fn dedup_reinforces_instead_of_duplicating() {
    let engine = test_memory();
    let opts = RetainOptions::default();

    let first = engine
        .retain(
            "default",
            &[fact("backups run nightly at two am", FactType::World)],
            &opts,
        )
        .unwrap();
    let second = engine
        .retain(
            "default",
            &[fact("backups run nightly at two am", FactType::World)],
            &opts,
        )
        .unwrap();

    assert!(!first[0].deduplicated);
    assert!(second[0].deduplicated);
    assert_eq!(first[0].id, second[0].id);
}

#[test]
fn access_write_through_skips_filtered_memories() {
    let engine = test_memory();
    engine
        .retain(
            "default",
            &[
                fact("release notes are drafted in the wiki", FactType::World),
                fact("release planning feels rushed this quarter", FactType::Opinion),
            ],
            &RetainOptions::default(),
        )
        .unwrap();

    // The opinion is retrieved by the methods but filtered before return.
    let opts = RecallOptions {
        fact_types: vec![FactType::World],
        ..Default::default()
    };
    let response = engine.recall("default", "release", &opts).unwrap();
    assert_eq!(response.memories.len(), 1);
    assert_eq!(response.memories[0].memory.access_count, 0);

    // Re-recall and confirm only the returned unit was bumped.
    let again = engine.recall("default", "release", &opts).unwrap();
    assert_eq!(again.memories[0].memory.access_count, 1);

    let everything = engine
        .recall("default", "release", &RecallOptions::default())
        .unwrap();
    let opinion = everything
        .memories
        .iter()
        .find(|m| m.memory.fact_type == FactType::Opinion)
        .expect("opinion unit exists");
    assert_eq!(opinion.memory.access_count, 0, "filtered units stay untouched");
}

#[test]
fn scope_change_starts_a_new_episode() {
    let engine = test_memory();

    let in_project_a = engine
        .retain(
            "default",
            &[fact("sketched the ingestion dag", FactType::Experience)],
            &RetainOptions {
                project: "alpha".into(),
                session: "s1".into(),
                ..Default::default()
            },
        )
        .unwrap();
    let in_project_b = engine
        .retain(
            "default",
            &[fact("reviewed the auth refactor", FactType::Experience)],
            &RetainOptions {
                project: "beta".into(),
                session: "s1".into(),
                ..Default::default()
            },
        )
        .unwrap();

    assert_ne!(in_project_a[0].episode_id, in_project_b[0].episode_id);
}

#[test]
fn entity_mentions_drive_cooccurrence_recall() {
    let engine = test_memory();
    let mut with_entities = fact("wired tokio metrics into grafana", FactType::World);
    with_entities.entities = vec![
        MentionInput {
            name: "tokio".into(),
            entity_type: "tool".into(),
        },
        MentionInput {
            name: "grafana".into(),
            entity_type: "tool".into(),
        },
    ];
    engine
        .retain("default", &[with_entities], &RetainOptions::default())
        .unwrap();

    let opts = RecallOptions {
        entities: vec!["grafana".into()],
        ..Default::default()
    };
    let response = engine.recall("default", "metrics", &opts).unwrap();
    assert_eq!(response.memories.len(), 1);
}

#[test]
fn cognitive_mode_boost_stays_in_its_session() {
    let engine = test_memory();
    engine
        .retain(
            "default",
            &[
                fact("the cache layer fronts the user service", FactType::World),
                fact("cache misses fall back to the primary", FactType::World),
            ],
            &RetainOptions::default(),
        )
        .unwrap();

    let opts = |session: &str| RecallOptions {
        mode: RecallMode::Cognitive,
        session_id: Some(session.to_string()),
        ..Default::default()
    };

    // Prime session A's working memory.
    engine.recall("default", "cache", &opts("a")).unwrap();
    let warmed = engine.recall("default", "cache", &opts("a")).unwrap();
    let cold = engine.recall("default", "cache", &opts("b")).unwrap();

    let top = &warmed.memories[0];
    let same_in_b = cold
        .memories
        .iter()
        .find(|m| m.memory.id == top.memory.id)
        .expect("same unit visible in both sessions");
    assert!(top.score > same_in_b.score);
}

#[test]
fn trace_is_opt_in() {
    let engine = test_memory();
    engine
        .retain(
            "default",
            &[fact("tracing output helps debugging recall", FactType::World)],
            &RetainOptions::default(),
        )
        .unwrap();

    let plain = engine
        .recall("default", "tracing", &RecallOptions::default())
        .unwrap();
    assert!(plain.trace.is_none());

    let traced = engine
        .recall(
            "default",
            "tracing",
            &RecallOptions {
                enable_trace: true,
                ..Default::default()
            },
        )
        .unwrap();
    let trace = traced.trace.unwrap();
    assert!(trace.per_method.contains_key("semantic"));
    assert!(trace.per_method.contains_key("fulltext"));
}
