//! Application screens reachable by voice

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A screen of the companion application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Home,
    Chat,
    Reminders,
    Vision,
    Family,
    Alarm,
    Safety,
    LiveCall,
    WeatherNews,
    RoleDetection,
    GuardianDashboard,
    MedCapture,
    Test,
}

impl Route {
    /// All routes
    pub const ALL: [Self; 13] = [
        Self::Home,
        Self::Chat,
        Self::Reminders,
        Self::Vision,
        Self::Family,
        Self::Alarm,
        Self::Safety,
        Self::LiveCall,
        Self::WeatherNews,
        Self::RoleDetection,
        Self::GuardianDashboard,
        Self::MedCapture,
        Self::Test,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Chat => "chat",
            Self::Reminders => "reminders",
            Self::Vision => "vision",
            Self::Family => "family",
            Self::Alarm => "alarm",
            Self::Safety => "safety",
            Self::LiveCall => "live_call",
            Self::WeatherNews => "weather_news",
            Self::RoleDetection => "role_detection",
            Self::GuardianDashboard => "guardian_dashboard",
            Self::MedCapture => "med_capture",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| Error::Intent(format!("unknown route: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_wire_name() {
        for route in Route::ALL {
            assert_eq!(route.as_str().parse::<Route>().unwrap(), route);
            let json = serde_json::to_string(&route).unwrap();
            assert_eq!(json, format!("\"{route}\""));
        }
        assert!("nowhere".parse::<Route>().is_err());
    }
}
