use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Baseline,
    Rag,
    Adapter,
    RagAdapter,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 4] = [
        AnalysisMode::Baseline,
        AnalysisMode::Rag,
        AnalysisMode::Adapter,
        AnalysisMode::RagAdapter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Baseline => "baseline",
            AnalysisMode::Rag => "rag",
            AnalysisMode::Adapter => "adapter",
            AnalysisMode::RagAdapter => "rag_adapter",
        }
    }

    pub fn uses_retrieval(&self) -> bool {
        matches!(self, AnalysisMode::Rag | AnalysisMode::RagAdapter)
    }

    pub fn needs_adapter(&self) -> bool {
        matches!(self, AnalysisMode::Adapter | AnalysisMode::RagAdapter)
    }

    fn with_retrieval(self) -> Self {
        match self {
            AnalysisMode::Baseline => AnalysisMode::Rag,
            AnalysisMode::Adapter => AnalysisMode::RagAdapter,
            other => other,
        }
    }

    /// Combine the submitted `mode` and `enable_rag` fields.
    ///
    /// Without a mode, `enable_rag` picks between baseline and RAG. With one,
    /// `enable_rag = true` adds retrieval and `false` never removes it.
    pub fn resolve(mode: Option<&str>, enable_rag: Option<bool>) -> Result<Self, Error> {
        let mode = match mode.map(str::trim).filter(|m| !m.is_empty()) {
            Some(m) => m.parse::<AnalysisMode>()?,
            None => AnalysisMode::Baseline,
        };
        Ok(if enable_rag == Some(true) {
            mode.with_retrieval()
        } else {
            mode
        })
    }
}

impl FromStr for AnalysisMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(AnalysisMode::Baseline),
            "rag" => Ok(AnalysisMode::Rag),
            "adapter" => Ok(AnalysisMode::Adapter),
            "rag_adapter" | "rag+adapter" | "rag-adapter" | "ragadapter" => {
                Ok(AnalysisMode::RagAdapter)
            }
            _ => Err(Error::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spellings() {
        assert_eq!("RAG".parse::<AnalysisMode>().unwrap(), AnalysisMode::Rag);
        assert_eq!(
            "rag+adapter".parse::<AnalysisMode>().unwrap(),
            AnalysisMode::RagAdapter
        );
        assert_eq!(
            " Rag-Adapter ".parse::<AnalysisMode>().unwrap(),
            AnalysisMode::RagAdapter
        );
        assert!(matches!(
            "fast".parse::<AnalysisMode>(),
            Err(Error::UnsupportedMode(m)) if m == "fast"
        ));
    }

    #[test]
    fn test_capabilities() {
        assert!(!AnalysisMode::Baseline.uses_retrieval());
        assert!(!AnalysisMode::Baseline.needs_adapter());
        assert!(AnalysisMode::Rag.uses_retrieval());
        assert!(AnalysisMode::Adapter.needs_adapter());
        assert!(AnalysisMode::RagAdapter.uses_retrieval() && AnalysisMode::RagAdapter.needs_adapter());
    }

    #[test]
    fn test_resolve_enable_rag() {
        use AnalysisMode::*;
        assert_eq!(AnalysisMode::resolve(None, None).unwrap(), Baseline);
        assert_eq!(AnalysisMode::resolve(None, Some(true)).unwrap(), Rag);
        assert_eq!(AnalysisMode::resolve(Some(""), Some(false)).unwrap(), Baseline);
        assert_eq!(AnalysisMode::resolve(Some("baseline"), Some(true)).unwrap(), Rag);
        assert_eq!(AnalysisMode::resolve(Some("adapter"), Some(true)).unwrap(), RagAdapter);
        assert_eq!(AnalysisMode::resolve(Some("rag"), Some(false)).unwrap(), Rag);
        assert!(AnalysisMode::resolve(Some("turbo"), Some(true)).is_err());
    }
}
