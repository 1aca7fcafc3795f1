use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identificador del propio reconciliador cuando actúa como "caller".
pub const RECONCILER_CALLER_ID: &str = "reconciler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallerType {
    Application,
    User,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub caller_type: CallerType,
    pub context: BTreeMap<String, String>,
}

/// Metadatos de auditoría que viajan con cada cambio de modelo.
///
/// El core no los interpreta: sólo los adjunta (como tag) a los holders
/// que toca cada acción, para saber quién pidió qué y por qué.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    pub caller_id: String,
    pub call_reason: String,
    pub callers: Vec<Caller>,
    pub call_path: Vec<String>,
    pub debug: bool,
}

impl CallMetadata {
    pub fn new(caller_id: impl Into<String>, call_reason: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            call_reason: call_reason.into(),
            callers: Vec::new(),
            call_path: Vec::new(),
            debug: false,
        }
    }

    /// Metadatos para cambios iniciados por el propio loop de reconciliación.
    pub fn reconciler(call_reason: impl Into<String>) -> Self {
        let mut metadata = Self::new(RECONCILER_CALLER_ID, call_reason);
        metadata.callers.push(Caller {
            id: RECONCILER_CALLER_ID.to_string(),
            caller_type: CallerType::Application,
            context: BTreeMap::new(),
        });
        metadata
    }

    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.call_path.push(caller.id.clone());
        self.callers.push(caller);
        self
    }
}
