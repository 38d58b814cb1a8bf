//! End-to-end scenarios driven through the public engine API in local mode.

use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use flipkit::{DynValue, Engine, ListenerToken};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn listen(engine: &Engine, feature: &str) -> (ListenerToken, Receiver<Option<String>>) {
    let (tx, rx) = channel();
    let token = engine.add_listener(feature, move |_feature, value| {
        let _ = tx.send(value.map(str::to_owned));
    });
    (token, rx)
}

fn params(entries: &[(&str, &str)]) -> BTreeMap<String, DynValue> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), DynValue::from(*v)))
        .collect()
}

#[test]
fn enable_after_three_events_and_rearm() {
    let engine = Engine::new_local(Some(
        r#"{
          "features": {
            "popup": [
              {
                "value": "on",
                "conditions": {
                  "events": {
                    "events": [
                      {"key": "level_complete", "count": {"operator": ">=", "value": 3}}
                    ]
                  }
                }
              }
            ]
          }
        }"#,
    ))
    .unwrap();

    engine.log_event("level_complete");
    engine.log_event("level_complete");
    assert_eq!(engine.get_feature_value("popup"), None);

    engine.log_event("level_complete");
    assert_eq!(engine.get_feature_value("popup").as_deref(), Some("on"));
    assert!(engine.is_feature_enabled("popup"));

    engine.reset_feature("popup");
    assert_eq!(engine.get_feature_value("popup"), None);
    assert!(!engine.is_feature_enabled("popup"));

    for _ in 0..3 {
        engine.log_event("level_complete");
    }
    assert_eq!(engine.get_feature_value("popup").as_deref(), Some("on"));
}

const PROMO_DOC: &str = r#"{
  "features": {
    "promo": [
      {
        "value": "v2",
        "conditions": {
          "events": {
            "mode": "sequence",
            "ordering": "direct",
            "events": [
              {"key": "launch"},
              {"key": "purchase", "param": {"amount": {"operator": ">=", "value": 10}}}
            ]
          }
        }
      }
    ]
  }
}"#;

#[test]
fn direct_sequence_with_params_small_purchase() {
    let engine = Engine::new_local(Some(PROMO_DOC)).unwrap();
    engine.log_event("launch");
    engine.log_event_with("purchase", params(&[("amount", "5")]));
    assert_eq!(engine.get_feature_value("promo"), None);
}

#[test]
fn direct_sequence_with_params_large_purchase() {
    let engine = Engine::new_local(Some(PROMO_DOC)).unwrap();
    engine.log_event("launch");
    engine.log_event_with("purchase", params(&[("amount", "15")]));
    assert_eq!(engine.get_feature_value("promo").as_deref(), Some("v2"));
}

#[test]
fn user_and_device_properties_combine() {
    let engine = Engine::new_local(Some(
        r#"{
          "features": {
            "beta_ui": [
              {
                "value": "on",
                "conditions": {
                  "user_properties": [
                    {"key": "role", "value": {"operator": "in", "value": ["beta", "admin"]}}
                  ],
                  "device": [
                    {"key": "country", "value": {"operator": "==", "value": "DE"}}
                  ]
                }
              }
            ]
          }
        }"#,
    ))
    .unwrap();

    engine.set_user_property("role", "beta");
    engine.set_device_property("country", "DE");
    assert_eq!(engine.get_feature_value("beta_ui").as_deref(), Some("on"));

    engine.remove_user_property("role");
    assert_eq!(engine.get_feature_value("beta_ui"), None);

    engine.set_user_property("role", "beta");
    engine.set_device_property("country", "US");
    assert_eq!(engine.get_feature_value("beta_ui"), None);
}

#[test]
fn negated_event_condition() {
    let engine = Engine::new_local(Some(
        r#"{
          "features": {
            "nudge": [
              {
                "value": "show",
                "conditions": {
                  "events": {"events": [{"key": "subscribed", "not": true}]}
                }
              }
            ]
          }
        }"#,
    ))
    .unwrap();

    // No `subscribed` event exists, so the negated condition holds. The
    // initial install already evaluates it.
    assert_eq!(engine.get_feature_value("nudge").as_deref(), Some("show"));

    engine.log_event("subscribed");
    assert_eq!(engine.get_feature_value("nudge"), None);
}

const DOC_X_A: &str = r#"{"features": {"x": [{"value": "a", "conditions": {}}]}}"#;
const DOC_X_B: &str = r#"{"features": {"x": [{"value": "b", "conditions": {}}]}}"#;

#[test]
fn rule_replacement_notifies_once() {
    let engine = Engine::new_local(Some(DOC_X_A)).unwrap();
    assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));

    let (_token, rx) = listen(&engine, "x");
    engine.install_rules(DOC_X_B).unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().as_deref(), Some("b"));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(engine.get_feature_value("x").as_deref(), Some("b"));
}

#[test]
fn reinstalling_the_same_document_is_idempotent() {
    let engine = Engine::new_local(Some(DOC_X_A)).unwrap();
    let (_token, rx) = listen(&engine, "x");

    engine.install_rules(DOC_X_A).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(engine.get_feature_value("x").as_deref(), Some("a"));
}

#[test]
fn listeners_observe_transitions_in_commit_order() {
    let engine = Engine::new_local(Some(DOC_X_A)).unwrap();
    let (_token, rx) = listen(&engine, "x");

    engine.install_rules(DOC_X_B).unwrap();
    engine.install_rules(DOC_X_A).unwrap();
    engine.install_rules(r#"{"features": {}}"#).unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().as_deref(), Some("b"));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().as_deref(), Some("a"));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), None);
}

#[test]
fn removed_listeners_stay_silent() {
    let engine = Engine::new_local(Some(DOC_X_A)).unwrap();
    let (token, rx) = listen(&engine, "x");
    engine.remove_listener(token);

    engine.install_rules(DOC_X_B).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let (_token, rx) = listen(&engine, "x");
    engine.clear_all_listeners();
    engine.install_rules(DOC_X_A).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn event_history_preserves_call_order() {
    let engine = Engine::new_local(None).unwrap();
    for i in 0..20 {
        engine.log_event(&format!("event_{i}"));
    }
    let history = engine.get_event_history();
    assert_eq!(history.len(), 20);
    for (i, record) in history.iter().enumerate() {
        assert_eq!(record.name, format!("event_{i}"));
    }

    engine.clear_event_history();
    assert!(engine.get_event_history().is_empty());
}

#[test]
fn clearing_history_reevaluates_features() {
    let engine = Engine::new_local(Some(
        r#"{
          "features": {
            "badge": [
              {
                "value": "gold",
                "conditions": {"events": {"events": [{"key": "win"}]}}
              }
            ]
          }
        }"#,
    ))
    .unwrap();

    engine.log_event("win");
    assert_eq!(engine.get_feature_value("badge").as_deref(), Some("gold"));

    let (_token, rx) = listen(&engine, "badge");
    engine.clear_event_history();
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), None);
    assert_eq!(engine.get_feature_value("badge"), None);
}

#[test]
fn absent_features_read_as_disabled() {
    let engine = Engine::new_local(Some(DOC_X_A)).unwrap();
    assert_eq!(engine.get_feature_value("missing"), None);
    assert!(!engine.is_feature_enabled("missing"));
    // "a" is a value, but not an enabled-reading one.
    assert!(!engine.is_feature_enabled("x"));
}

#[test]
fn enabled_values_are_case_insensitive() {
    let engine = Engine::new_local(Some(
        r#"{"features": {"f": [{"value": "Enabled", "conditions": {}}]}}"#,
    ))
    .unwrap();
    assert!(engine.is_feature_enabled("f"));
}

#[test]
fn reset_all_features_clears_every_value() {
    let engine = Engine::new_local(Some(
        r#"{
          "features": {
            "one": [{"value": "1", "conditions": {}}],
            "two": [{"value": "2", "conditions": {}}]
          }
        }"#,
    ))
    .unwrap();
    assert!(engine.is_feature_enabled("one"));

    engine.reset_all_features();
    assert_eq!(engine.get_feature_value("one"), None);
    assert_eq!(engine.get_feature_value("two"), None);

    // The next mutation re-evaluates and restores matching rules.
    engine.log_event("anything");
    assert_eq!(engine.get_feature_value("one").as_deref(), Some("1"));
}

#[test]
fn all_feature_values_snapshot() {
    let engine = Engine::new_local(Some(
        r#"{
          "features": {
            "served": [{"value": "yes", "conditions": {}}],
            "gated": [
              {
                "value": "no",
                "conditions": {
                  "user_properties": [
                    {"key": "vip", "value": {"operator": "==", "value": "1"}}
                  ]
                }
              }
            ]
          }
        }"#,
    ))
    .unwrap();

    let all = engine.get_all_feature_values();
    assert_eq!(all.get("served").unwrap().as_deref(), Some("yes"));
    assert_eq!(all.get("gated").unwrap(), &None);
}

#[test]
fn legacy_document_shape_is_accepted() {
    let engine = Engine::new_local(Some(
        r#"{"banner": [{"value": "legacy", "conditions": {}}]}"#,
    ))
    .unwrap();
    assert_eq!(engine.get_feature_value("banner").as_deref(), Some("legacy"));
}

#[test]
fn malformed_local_document_is_rejected() {
    assert!(Engine::new_local(Some("not json")).is_err());
}
