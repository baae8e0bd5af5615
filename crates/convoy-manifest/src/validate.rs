//! Manifest validation and default filling.

use convoy_core::manifest::{
    API_VERSIONS, CanaryConfig, HealthCheck, Hook, KIND_DEPLOYMENT, Manifest, PercentOrInt,
    RollingUpdateConfig, Strategy, StrategyType,
};
use convoy_core::selector::{Operator, Selector};

use crate::error::{ManifestError, ManifestResult};

const DEFAULT_NAMESPACE: &str = "default";

/// Validate a parsed manifest against the schema rules. On success, defaults
/// are filled in place: namespace, strategy type tag and strategy config.
pub fn validate(manifest: &mut Manifest) -> ManifestResult<()> {
    if !API_VERSIONS.contains(&manifest.api_version.as_str()) {
        return Err(ManifestError::InvalidValue {
            field: "apiVersion".to_string(),
            message: format!(
                "must be one of {}, got {:?}",
                API_VERSIONS.join(", "),
                manifest.api_version
            ),
        });
    }
    if manifest.kind != KIND_DEPLOYMENT {
        return Err(ManifestError::InvalidValue {
            field: "kind".to_string(),
            message: format!("must be {:?}, got {:?}", KIND_DEPLOYMENT, manifest.kind),
        });
    }
    if manifest.metadata.name.trim().is_empty() {
        return Err(ManifestError::MissingField("metadata.name".to_string()));
    }
    if manifest.metadata.namespace.is_empty() {
        manifest.metadata.namespace = DEFAULT_NAMESPACE.to_string();
    }

    validate_selector(&manifest.spec.selector)?;
    validate_strategy(manifest)?;
    validate_template(manifest)?;

    Ok(())
}

fn validate_selector(selector: &Selector) -> ManifestResult<()> {
    if selector.is_empty() {
        return Err(ManifestError::MissingField(
            "spec.selector: at least one of matchLabels or matchExpressions".to_string(),
        ));
    }
    for expr in &selector.match_expressions {
        if expr.key.is_empty() {
            return Err(ManifestError::MissingField(
                "spec.selector.matchExpressions[].key".to_string(),
            ));
        }
        match expr.operator {
            Operator::In | Operator::NotIn => {
                if expr.values.is_empty() {
                    return Err(ManifestError::InvalidValue {
                        field: format!("spec.selector.matchExpressions[{}]", expr.key),
                        message: "In/NotIn require a non-empty values list".to_string(),
                    });
                }
            }
            Operator::Exists | Operator::DoesNotExist => {
                if !expr.values.is_empty() {
                    return Err(ManifestError::InvalidValue {
                        field: format!("spec.selector.matchExpressions[{}]", expr.key),
                        message: "Exists/DoesNotExist take no values".to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn validate_strategy(manifest: &mut Manifest) -> ManifestResult<()> {
    let strategy =
        Strategy::from_spec(&manifest.spec.strategy).map_err(ManifestError::InvalidStrategy)?;

    match &strategy {
        Strategy::RollingUpdate(cfg) => validate_rolling(cfg)?,
        Strategy::Canary(cfg) => validate_canary(cfg)?,
        Strategy::BlueGreen(_) => {}
    }

    // Fill the resolved shape back in so serialization carries the defaults.
    let spec = &mut manifest.spec.strategy;
    match strategy {
        Strategy::RollingUpdate(cfg) => {
            spec.strategy_type = Some(StrategyType::RollingUpdate);
            spec.rolling_update = Some(cfg);
        }
        Strategy::Canary(cfg) => {
            spec.strategy_type = Some(StrategyType::Canary);
            spec.canary = Some(cfg);
        }
        Strategy::BlueGreen(cfg) => {
            spec.strategy_type = Some(StrategyType::BlueGreen);
            spec.blue_green = Some(cfg);
        }
    }
    Ok(())
}

fn validate_rolling(cfg: &RollingUpdateConfig) -> ManifestResult<()> {
    validate_percent("spec.strategy.rollingUpdate.maxUnavailable", cfg.max_unavailable)?;
    validate_percent("spec.strategy.rollingUpdate.maxSurge", cfg.max_surge)?;
    Ok(())
}

fn validate_percent(field: &str, value: PercentOrInt) -> ManifestResult<()> {
    if value.is_percent() && value.value() > 100 {
        return Err(ManifestError::InvalidValue {
            field: field.to_string(),
            message: format!("percentage must be between 0 and 100, got {}", value),
        });
    }
    Ok(())
}

fn validate_canary(cfg: &CanaryConfig) -> ManifestResult<()> {
    if cfg.steps.is_empty() {
        return Err(ManifestError::MissingField(
            "spec.strategy.canary.steps".to_string(),
        ));
    }
    let mut previous = 0u32;
    for (i, step) in cfg.steps.iter().enumerate() {
        if step.weight == 0 || step.weight > 100 {
            return Err(ManifestError::InvalidStrategy(format!(
                "canary step {} weight must be in (0, 100], got {}",
                i, step.weight
            )));
        }
        if step.weight <= previous {
            return Err(ManifestError::InvalidStrategy(format!(
                "canary step weights must be strictly increasing, step {} has {} after {}",
                i, step.weight, previous
            )));
        }
        previous = step.weight;
    }
    if cfg.steps.last().map(|s| s.weight) != Some(100) {
        return Err(ManifestError::InvalidStrategy(
            "final canary step must have weight of 100".to_string(),
        ));
    }
    if let Some(analysis) = &cfg.analysis {
        if analysis.metrics.is_empty() {
            return Err(ManifestError::MissingField(
                "spec.strategy.canary.analysis.metrics".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_template(manifest: &Manifest) -> ManifestResult<()> {
    let template = &manifest.spec.template.spec;
    if template.artifacts.is_empty() {
        return Err(ManifestError::MissingField(
            "spec.template.spec.artifacts".to_string(),
        ));
    }
    for (i, artifact) in template.artifacts.iter().enumerate() {
        if artifact.name.trim().is_empty() {
            return Err(ManifestError::MissingField(format!(
                "spec.template.spec.artifacts[{}].name",
                i
            )));
        }
        if artifact.version.trim().is_empty() {
            return Err(ManifestError::MissingField(format!(
                "spec.template.spec.artifacts[{}].version",
                i
            )));
        }
    }
    if let Some(check) = &template.health_check {
        validate_health_check(check)?;
    }
    for (field, hook) in [
        ("preDeploy", &template.pre_deploy),
        ("postDeploy", &template.post_deploy),
    ] {
        if let Some(hook) = hook {
            validate_hook(field, hook)?;
        }
    }
    Ok(())
}

fn validate_health_check(check: &HealthCheck) -> ManifestResult<()> {
    let probes = [
        check.http_get.is_some(),
        check.exec.is_some(),
        check.tcp_socket.is_some(),
    ];
    let count = probes.iter().filter(|p| **p).count();
    if count != 1 {
        return Err(ManifestError::InvalidValue {
            field: "spec.template.spec.healthCheck".to_string(),
            message: "exactly one of httpGet, exec or tcpSocket is required".to_string(),
        });
    }
    if let Some(exec) = &check.exec {
        if exec.command.is_empty() {
            return Err(ManifestError::MissingField(
                "spec.template.spec.healthCheck.exec.command".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_hook(field: &str, hook: &Hook) -> ManifestResult<()> {
    if hook.command.is_empty() {
        return Err(ManifestError::MissingField(format!(
            "spec.template.spec.{}.command",
            field
        )));
    }
    Ok(())
}
