mod common;

use common::{TestEvaluator, constant, engine, node};
use flowgraph_rs::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;

fn build(flow: FlowBuilder) -> Arc<FlowContainer> {
    Arc::new(flow.build().unwrap())
}

// ------------------------------------
// 1. Memoization
// ------------------------------------

#[tokio::test]
async fn test_shared_data_source_is_evaluated_once() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("diamond")
            .start("a")
            .node(node("counter", NodeKind::action("count", None)))
            .node(node("a", NodeKind::action("data + 10", Some("counter"))).next("b"))
            .node(node("b", NodeKind::action("data + 20", Some("counter"))).next("ret"))
            .node(node(
                "both",
                NodeKind::CollectionDataSource {
                    elements: vec!["a".into(), "b".into(), "counter".into()],
                },
            ))
            .node(node("ret", NodeKind::returning(None, Some("both")))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.value, json!([11, 21, 1]));
    assert_eq!(evaluator.count(), 1);
}

#[tokio::test]
async fn test_data_cycle_is_reported() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("cycle")
            .start("use")
            .node(node("list", NodeKind::CollectionDataSource { elements: vec!["head".into()] }))
            .node(node("head", NodeKind::First { data_source: Some("list".into()) }))
            .node(node("use", NodeKind::action("data", Some("list")))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    let error = result.error.unwrap();
    assert!(error.is_configuration());
    assert!(matches!(error.root_cause(), FlowError::DataCycle(_)));
}

#[tokio::test]
async fn test_aggregate_start_value_cycle_is_reported() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("cycle")
            .start("ret")
            .node(node(
                "tally",
                NodeKind::Aggregate {
                    script: None,
                    data_source: None,
                    start_value: Some("seed".into()),
                },
            ))
            .node(node("seed", NodeKind::First { data_source: Some("tally".into()) }))
            .node(node("ret", NodeKind::returning(None, Some("tally")))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    let error = result.error.unwrap();
    assert!(error.is_configuration());
    assert!(matches!(error.root_cause(), FlowError::DataCycle(_)));
}

// ------------------------------------
// 2. Decisions
// ------------------------------------

fn decision_flow() -> Arc<FlowContainer> {
    build(
        FlowBuilder::new("decide")
            .start("decide")
            .node(node("flag", NodeKind::parameter("flag")))
            .node(node("decide", NodeKind::decision("flag", Some("yes"), Some("no"))))
            .node(node("yes", NodeKind::action("record('yes')", None)))
            .node(node("no", NodeKind::action("record('no')", None))),
    )
}

#[tokio::test]
async fn test_decision_takes_exactly_one_branch() {
    for (flag, taken, skipped) in [(true, "yes", "no"), (false, "no", "yes")] {
        let evaluator = TestEvaluator::new();
        let context = FlowContext::new().with_parameter("flag", json!(flag));

        let result = engine(&evaluator).run(&context, &decision_flow()).await;

        assert_eq!(result.value, json!(taken));
        assert_eq!(evaluator.recorded(), vec![json!(taken)]);
        assert!(!result.execution_path.contains(&NodeId::new(skipped)));
    }
}

#[tokio::test]
async fn test_decision_on_null_takes_false_branch() {
    let evaluator = TestEvaluator::new();

    let result = engine(&evaluator)
        .run(&FlowContext::new(), &decision_flow())
        .await;

    assert!(result.is_success());
    assert_eq!(evaluator.recorded(), vec![json!("no")]);
}

#[tokio::test]
async fn test_missing_branch_terminates_path() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("one-sided")
            .start("decide")
            .node(constant("flag", json!(false)))
            .node(node("decide", NodeKind::decision("flag", Some("yes"), None)))
            .node(node("yes", NodeKind::action("record('yes')", None))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    assert!(result.is_success());
    assert_eq!(result.value, Value::Null);
    assert!(evaluator.recorded().is_empty());
}

// ------------------------------------
// 3. Loops
// ------------------------------------

fn loop_flow(items: Value, body: FlowNode) -> Arc<FlowContainer> {
    build(
        FlowBuilder::new("loop")
            .start("each")
            .node(constant("items", items))
            .node(node("each", NodeKind::for_each("items", Some("body"))).next("after"))
            .node(body)
            .node(node("end", NodeKind::returning(None, None)))
            .node(node("after", NodeKind::action("record('done')", None))),
    )
}

#[tokio::test]
async fn test_loop_runs_body_once_per_element_in_order() {
    let evaluator = TestEvaluator::new();
    let flow = loop_flow(
        json!([1, 2, 3]),
        node("body", NodeKind::action("record(data)", Some("each"))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    assert!(result.is_success());
    assert_eq!(
        evaluator.recorded(),
        vec![json!(1), json!(2), json!(3), json!("done")]
    );
    assert_eq!(result.value, json!("done"));
}

#[tokio::test]
async fn test_return_in_loop_body_ends_only_the_iteration() {
    let evaluator = TestEvaluator::new();
    let flow = loop_flow(
        json!(["a", "b"]),
        node("body", NodeKind::action("record(data)", Some("each"))).next("end"),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    assert_eq!(
        evaluator.recorded(),
        vec![json!("a"), json!("b"), json!("done")]
    );
    assert_eq!(result.value, json!("done"));
}

#[tokio::test]
async fn test_loop_over_null_is_empty() {
    let evaluator = TestEvaluator::new();
    let flow = loop_flow(
        Value::Null,
        node("body", NodeKind::action("record(data)", Some("each"))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    assert!(result.is_success());
    assert_eq!(evaluator.recorded(), vec![json!("done")]);
}

#[tokio::test]
async fn test_loop_body_failure_belongs_to_the_loop() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("loop")
            .start("each")
            .node(constant("items", json!([1, 2, 3])))
            .node(
                node("each", NodeKind::for_each("items", Some("body")))
                    .next("after")
                    .handled_by("handler"),
            )
            .node(node("body", NodeKind::action("record(data)", Some("each"))).next("boom"))
            .node(node("boom", NodeKind::action("fail", None)))
            .node(node("handler", NodeKind::ExceptionHandler).next("recovered"))
            .node(node("recovered", NodeKind::action("record('recovered')", None)))
            .node(node("after", NodeKind::action("record('after')", None))),
    );

    let context = FlowContext::new();
    let result = engine(&evaluator).run(&context, &flow).await;

    assert!(result.is_success());
    assert_eq!(evaluator.recorded(), vec![json!(1), json!("recovered")]);

    let recovered = context.recovered_errors();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].node(), Some(&NodeId::new("boom")));
}

/// `each` loops over [1, 2, 3]; its body records the element, then fails
fn failing_loop(loop_handler: bool) -> Arc<FlowContainer> {
    let mut each = node("each", NodeKind::for_each("items", Some("body"))).next("after");
    if loop_handler {
        each = each.handled_by("loop-handler");
    }
    build(
        FlowBuilder::new("loop")
            .start("each")
            .exception_handler("default")
            .node(constant("items", json!([1, 2, 3])))
            .node(each)
            .node(node("body", NodeKind::action("record(data)", Some("each"))).next("boom"))
            .node(node("boom", NodeKind::action("fail", None)))
            .node(node("loop-handler", NodeKind::ExceptionHandler).next("on-loop"))
            .node(node("on-loop", NodeKind::action("record('loop')", None)))
            .node(node("default", NodeKind::ExceptionHandler).next("on-default"))
            .node(node("on-default", NodeKind::action("record('default')", None)))
            .node(node("after", NodeKind::action("record('after')", None))),
    )
}

#[tokio::test]
async fn test_loop_handler_wins_over_flow_default() {
    let evaluator = TestEvaluator::new();
    let context = FlowContext::new();

    let result = engine(&evaluator).run(&context, &failing_loop(true)).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(evaluator.recorded(), vec![json!(1), json!("loop")]);
    assert_eq!(context.recovered_errors().len(), 1);
}

#[tokio::test]
async fn test_unhandled_loop_failure_reaches_flow_default() {
    let evaluator = TestEvaluator::new();
    let context = FlowContext::new();

    let result = engine(&evaluator).run(&context, &failing_loop(false)).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(evaluator.recorded(), vec![json!(1), json!("default")]);

    let recovered = context.recovered_errors();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].origin(), Some(&NodeId::new("boom")));
}

#[tokio::test]
async fn test_aggregate_without_script_collects_values() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("collect")
            .start("each")
            .node(constant("items", json!(["x", "y"])))
            .node(node("each", NodeKind::for_each("items", Some("collect"))).next("ret"))
            .node(node(
                "collect",
                NodeKind::Aggregate {
                    script: None,
                    data_source: Some("each".into()),
                    start_value: None,
                },
            ))
            .node(node("ret", NodeKind::returning(None, Some("collect")))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    assert_eq!(result.value, json!(["x", "y"]));
}

// ------------------------------------
// 4. Switches
// ------------------------------------

fn switch_flow(default: Option<&str>) -> Arc<FlowContainer> {
    build(
        FlowBuilder::new("switch")
            .start("switch")
            .node(node("value", NodeKind::parameter("value")))
            .node(node("switch", NodeKind::switch("value", &["first", "second"], default)))
            .node(node("first", NodeKind::switch_case(json!("b"))).next("take-first"))
            .node(node("second", NodeKind::switch_case(json!("b"))).next("take-second"))
            .node(node("fallback", NodeKind::action("record('default')", None)))
            .node(node("take-first", NodeKind::action("record('first')", None)))
            .node(node("take-second", NodeKind::action("record('second')", None))),
    )
}

#[tokio::test]
async fn test_switch_takes_first_matching_case() {
    let evaluator = TestEvaluator::new();
    let context = FlowContext::new().with_parameter("value", json!("b"));

    engine(&evaluator)
        .run(&context, &switch_flow(Some("fallback")))
        .await;

    assert_eq!(evaluator.recorded(), vec![json!("first")]);
}

#[tokio::test]
async fn test_switch_without_match_takes_default() {
    let evaluator = TestEvaluator::new();
    let context = FlowContext::new().with_parameter("value", json!("z"));

    engine(&evaluator)
        .run(&context, &switch_flow(Some("fallback")))
        .await;

    assert_eq!(evaluator.recorded(), vec![json!("default")]);
}

#[tokio::test]
async fn test_switch_on_null_without_default_ends_path() {
    let evaluator = TestEvaluator::new();

    let result = engine(&evaluator)
        .run(&FlowContext::new(), &switch_flow(None))
        .await;

    assert!(result.is_success());
    assert!(evaluator.recorded().is_empty());
}

// ------------------------------------
// 5. Exception handling
// ------------------------------------

#[tokio::test]
async fn test_handler_exposes_pre_failure_value() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("flaky")
            .start("log")
            .node(node("log", NodeKind::Log { script: None, data_source: Some("flaky".into()) }).next("flaky"))
            .node(node("flaky", NodeKind::action("flaky", None)).handled_by("handler").next("never"))
            .node(node("never", NodeKind::action("record('never')", None)))
            .node(node("handler", NodeKind::ExceptionHandler).next("ret"))
            .node(node("ret", NodeKind::returning(None, Some("handler")))),
    );

    let context = FlowContext::new();
    let result = engine(&evaluator).run(&context, &flow).await;

    assert!(result.error.is_none());
    assert_eq!(result.value, json!("first"));
    assert_eq!(context.data(&NodeId::new("flaky")), Some(Value::Null));
    assert!(evaluator.recorded().is_empty());
}

#[tokio::test]
async fn test_unhandled_error_identifies_failing_node() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("fails")
            .start("ok")
            .node(node("ok", NodeKind::action("1", None)).next("boom"))
            .node(node("boom", NodeKind::action("fail", None)).next("never"))
            .node(node("never", NodeKind::action("record('never')", None))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    let error = result.error.unwrap();
    assert_eq!(error.origin(), Some(&NodeId::new("boom")));
    assert!(matches!(error.root_cause(), FlowError::Script(_)));
    assert_eq!(result.value, Value::Null);
    assert!(evaluator.recorded().is_empty());
}

#[tokio::test]
async fn test_error_in_pulled_data_source_is_attributed_to_it() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("deep")
            .start("use")
            .node(node("bad", NodeKind::action("fail", None)))
            .node(node("use", NodeKind::action("data", Some("bad")))),
    );

    let result = engine(&evaluator).run(&FlowContext::new(), &flow).await;

    let error = result.error.unwrap();
    assert_eq!(error.node(), Some(&NodeId::new("bad")));
}

// ------------------------------------
// 6. Store and log
// ------------------------------------

#[tokio::test]
async fn test_store_and_retrieve() {
    let evaluator = TestEvaluator::new();
    let flow = build(
        FlowBuilder::new("store")
            .start("save")
            .node(constant("value", json!({"n": 1})))
            .node(node("save", NodeKind::store("slot", "value")).next("load"))
            .node(node("load", NodeKind::retrieve("slot")).next("log"))
            .node(node("log", NodeKind::Log { script: Some("data.n + 1".into()), data_source: Some("load".into()) })),
    );

    let context = FlowContext::new();
    let result = engine(&evaluator).run(&context, &flow).await;

    assert_eq!(result.value, json!(2));
    assert_eq!(context.store_get("slot"), Some(json!({"n": 1})));
    assert_eq!(context.data(&NodeId::new("load")), Some(json!({"n": 1})));
}
