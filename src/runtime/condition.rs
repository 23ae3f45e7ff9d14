/// Condition node: evaluates an expression and selects the "true" or "false" handle
///
/// Expressions use the pin syntax:
/// - `$json` / `$json.user.age`: the node input (numeric segments index arrays)
/// - `$vars.threshold`: workflow variables
/// - `$trigger.path`: the run's trigger input
/// - anything else: a JSON literal, or a plain string when it does not parse
///
/// With an `operator`, the expression is compared against `value` (which may
/// itself be a pin). Without one, the expression's value is coerced by truthiness.

use crate::error::EngineError;
use crate::runtime::executor::{NodeContext, NodeExecutor, NodeOutcome};
use crate::workflow::graph::{HANDLE_FALSE, HANDLE_TRUE};
use crate::workflow::types::Node;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::cmp::Ordering;

#[derive(Debug, Default)]
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(&self, node: &Node, input: Value, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        let expression = node
            .config
            .get("expression")
            .ok_or_else(|| EngineError::node(&node.id, "condition is missing 'expression'"))?;

        let value = resolve_operand(expression, &input, ctx);
        let result = match node.config_str("operator") {
            Some(operator) => {
                let expected = node
                    .config
                    .get("value")
                    .map(|v| resolve_operand(v, &input, ctx))
                    .unwrap_or(Value::Null);
                compare(operator, &value, &expected).map_err(|msg| EngineError::node(&node.id, msg))?
            }
            None => is_truthy(&value),
        };

        tracing::debug!("🔀 Condition '{}' evaluated to {} (value: {})", node.id, result, value);

        let handle = if result { HANDLE_TRUE } else { HANDLE_FALSE };
        Ok(NodeOutcome::branch(json!({ "result": result, "value": value }), handle))
    }
}

/// Resolve a config operand: pin strings are looked up, other JSON is literal
fn resolve_operand(operand: &Value, input: &Value, ctx: &NodeContext) -> Value {
    match operand {
        Value::String(expr) => evaluate_pin(expr, input, ctx),
        other => other.clone(),
    }
}

/// Evaluate a single pin expression
pub fn evaluate_pin(expr: &str, input: &Value, ctx: &NodeContext) -> Value {
    let expr = expr.trim();
    if expr == "$json" {
        return input.clone();
    }
    if let Some(path) = expr.strip_prefix("$json.") {
        return extract_path(input, path);
    }
    if let Some(path) = expr.strip_prefix("$vars.") {
        return extract_path(&ctx.variables, path);
    }
    if expr == "$trigger" {
        return ctx.trigger_input.clone();
    }
    if let Some(path) = expr.strip_prefix("$trigger.") {
        return extract_path(&ctx.trigger_input, path);
    }
    // Fallback: literal value
    serde_json::from_str(expr).unwrap_or_else(|_| Value::String(expr.to_string()))
}

/// Walk a dotted path; missing segments resolve to null
pub fn extract_path(root: &Value, path: &str) -> Value {
    let mut current = root;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        current = match current {
            Value::Object(obj) => obj.get(part).unwrap_or(&Value::Null),
            Value::Array(items) => match part.parse::<usize>() {
                Ok(i) => items.get(i).unwrap_or(&Value::Null),
                Err(_) => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// null, false, 0 and "" are false; everything else is true
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(operator: &str, left: &Value, right: &Value) -> Result<bool, String> {
    let result = match operator {
        "equals" | "eq" => loosely_equal(left, right),
        "not_equals" | "ne" => !loosely_equal(left, right),
        "gt" => order(left, right) == Some(Ordering::Greater),
        "gte" => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
        "lt" => order(left, right) == Some(Ordering::Less),
        "lte" => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        "contains" => match left {
            Value::String(s) => right.as_str().map(|needle| s.contains(needle)).unwrap_or(false),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, right)),
            Value::Object(obj) => right.as_str().map(|key| obj.contains_key(key)).unwrap_or(false),
            _ => false,
        },
        "exists" => !left.is_null(),
        other => return Err(format!("unknown condition operator '{}'", other)),
    };
    Ok(result)
}

/// Numbers compare by value regardless of integer/float representation
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Numbers order numerically, strings lexicographically; anything else is unordered
fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::NodeType;

    fn ctx() -> NodeContext {
        NodeContext {
            variables: json!({ "threshold": 5 }),
            trigger_input: json!({ "source": "test" }),
            ..NodeContext::default()
        }
    }

    async fn select(config: Value, input: Value) -> Option<String> {
        let node = Node::new("cond", NodeType::Condition, config);
        ConditionExecutor.execute(&node, input, &ctx()).await.unwrap().selected_handle
    }

    #[tokio::test]
    async fn truthiness_without_operator() {
        assert_eq!(select(json!({ "expression": "$json.result" }), json!({ "result": true })).await.as_deref(), Some("true"));
        for falsy in [json!(null), json!(false), json!(0), json!(0.0), json!("")] {
            let handle = select(json!({ "expression": "$json.result" }), json!({ "result": falsy })).await;
            assert_eq!(handle.as_deref(), Some("false"));
        }
        assert_eq!(select(json!({ "expression": "$json.result" }), json!({ "result": "no" })).await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn operators_compare_against_pins_and_literals() {
        let input = json!({ "score": 7, "tags": ["a", "b"], "name": "flowgate" });
        assert_eq!(select(json!({ "expression": "$json.score", "operator": "gt", "value": "$vars.threshold" }), input.clone()).await.as_deref(), Some("true"));
        assert_eq!(select(json!({ "expression": "$json.score", "operator": "lte", "value": 6.5 }), input.clone()).await.as_deref(), Some("false"));
        assert_eq!(select(json!({ "expression": "$json.tags", "operator": "contains", "value": "b" }), input.clone()).await.as_deref(), Some("true"));
        assert_eq!(select(json!({ "expression": "$json.name", "operator": "equals", "value": "flowgate" }), input.clone()).await.as_deref(), Some("true"));
        assert_eq!(select(json!({ "expression": "$json.missing", "operator": "exists" }), input.clone()).await.as_deref(), Some("false"));
        assert_eq!(select(json!({ "expression": "$trigger.source", "operator": "equals", "value": "test" }), input).await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn literal_expressions_are_used_as_is() {
        assert_eq!(select(json!({ "expression": false }), json!({ "x": 1 })).await.as_deref(), Some("false"));
        assert_eq!(select(json!({ "expression": 9, "operator": "gt", "value": "$vars.threshold" }), json!({})).await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn mismatched_types_do_not_order() {
        let handle = select(json!({ "expression": "$json.score", "operator": "gt", "value": 1 }), json!({ "score": "high" })).await;
        assert_eq!(handle.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn unknown_operator_fails_the_node() {
        let node = Node::new("cond", NodeType::Condition, json!({ "expression": "$json", "operator": "matches" }));
        let err = ConditionExecutor.execute(&node, json!(1), &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::NodeExecution { .. }));
    }

    #[test]
    fn paths_index_into_arrays() {
        let data = json!({ "items": [{ "id": 1 }, { "id": 2 }] });
        assert_eq!(extract_path(&data, "items.1.id"), json!(2));
        assert_eq!(extract_path(&data, "items.x"), Value::Null);
    }
}
