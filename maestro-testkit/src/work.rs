use serde::{Deserialize, Serialize};
use std::fmt::Display;

use maestro::WorkType;

/// The long-running work kinds of the media platform backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestWorkType {
    Analysis,
    Generation,
    Training,
}

impl WorkType for TestWorkType {
    fn as_str(&self) -> &'static str {
        match self {
            TestWorkType::Analysis => "analysis",
            TestWorkType::Generation => "generation",
            TestWorkType::Training => "training",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "analysis" => Some(TestWorkType::Analysis),
            "generation" => Some(TestWorkType::Generation),
            "training" => Some(TestWorkType::Training),
            _ => None,
        }
    }
}

impl Display for TestWorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
