//! Rego evaluation of attestation state.
//!
//! Each module is loaded into a fresh `regorus` engine with the
//! attestation JSON as `input`. The module's `deny` rule is queried;
//! any message it yields rejects the attestation.

use serde_json::Value;

use crate::error::PolicyError;
use crate::step::RegoPolicy;

fn package_name(module: &str) -> Result<&str, PolicyError> {
    module
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("package "))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| PolicyError::RegoError("module has no package declaration".to_owned()))
}

/// Messages produced by the `deny` rule of `policy` for `input`.
pub fn deny_reasons(policy: &RegoPolicy, input: &Value) -> Result<Vec<String>, PolicyError> {
    let module = std::str::from_utf8(&policy.module).map_err(|e| {
        PolicyError::RegoError(format!("module `{}` is not UTF-8: {e}", policy.name))
    })?;
    let package = package_name(module)?;

    let mut engine = regorus::Engine::new();
    engine
        .add_policy(policy.name.clone(), module.to_owned())
        .map_err(|e| PolicyError::RegoError(format!("module `{}`: {e}", policy.name)))?;
    let input = regorus::Value::from_json_str(&input.to_string())
        .map_err(|e| PolicyError::RegoError(format!("input conversion failed: {e}")))?;
    engine.set_input(input);

    let results = engine
        .eval_query(format!("data.{package}.deny"), false)
        .map_err(|e| PolicyError::RegoError(format!("module `{}`: {e}", policy.name)))?;

    let mut reasons = Vec::new();
    for result in results.result {
        for expression in result.expressions {
            let value = serde_json::to_value(&expression.value)?;
            collect_reasons(value, &mut reasons);
        }
    }
    Ok(reasons)
}

fn collect_reasons(value: Value, reasons: &mut Vec<String>) {
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => reasons.push("denied".to_owned()),
        Value::String(s) => reasons.push(s),
        Value::Array(items) => {
            for item in items {
                collect_reasons(item, reasons);
            }
        }
        other => reasons.push(other.to_string()),
    }
}

/// Evaluate every policy; the first one with deny messages rejects.
pub fn evaluate(policies: &[RegoPolicy], input: &Value) -> Result<(), PolicyError> {
    for policy in policies {
        let reasons = deny_reasons(policy, input)?;
        if !reasons.is_empty() {
            return Err(PolicyError::RegoDenied {
                policy: policy.name.clone(),
                reasons,
            });
        }
        tracing::debug!(policy = %policy.name, "rego policy passed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn policy(module: &str) -> RegoPolicy {
        RegoPolicy {
            name: "exit-code".to_owned(),
            module: module.as_bytes().to_vec(),
        }
    }

    const EXIT_CODE: &str = r#"package vouch.commandrun

import rego.v1

deny contains msg if {
    input.exitCode != 0
    msg := "command exited non-zero"
}
"#;

    #[test]
    fn deny_messages_reject() {
        let err = evaluate(&[policy(EXIT_CODE)], &json!({"exitCode": 2})).unwrap_err();
        match err {
            PolicyError::RegoDenied { policy, reasons } => {
                assert_eq!(policy, "exit-code");
                assert_eq!(reasons, vec!["command exited non-zero"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_deny_set_passes() {
        evaluate(&[policy(EXIT_CODE)], &json!({"exitCode": 0})).unwrap();
    }

    #[test]
    fn broken_module_is_a_malfunction() {
        let err = evaluate(&[policy("package broken\n\ndeny contains if {")], &json!({})).unwrap_err();
        assert!(matches!(err, PolicyError::RegoError(_)));
        assert!(!err.is_denial());
    }

    #[test]
    fn missing_package_rejected() {
        let err = deny_reasons(&policy("deny := true"), &json!({})).unwrap_err();
        assert!(matches!(err, PolicyError::RegoError(_)));
    }
}
