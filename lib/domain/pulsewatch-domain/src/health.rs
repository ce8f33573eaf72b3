use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        }
    }

    /// Any critical component makes the system critical; more than one
    /// warning makes it warning; a single warning is tolerated.
    pub fn overall<'a>(levels: impl IntoIterator<Item = &'a HealthLevel>) -> HealthLevel {
        let mut warnings = 0usize;
        for level in levels {
            match level {
                HealthLevel::Critical => return HealthLevel::Critical,
                HealthLevel::Warning => warnings += 1,
                HealthLevel::Healthy => {}
            }
        }
        if warnings > 1 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub level: HealthLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            level: HealthLevel::Healthy,
            detail: None,
        }
    }

    pub fn warning(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            level: HealthLevel::Warning,
            detail: Some(detail.into()),
        }
    }

    pub fn critical(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            level: HealthLevel::Critical,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthStatus {
    pub overall: HealthLevel,
    pub components: Vec<ComponentHealth>,
    pub active_alerts: usize,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealthStatus {
    pub fn from_components(
        components: Vec<ComponentHealth>,
        active_alerts: usize,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let overall = HealthLevel::overall(components.iter().map(|c| &c.level));
        Self {
            overall,
            components,
            active_alerts,
            checked_at,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == name)
    }
}
