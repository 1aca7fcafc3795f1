use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ModelActionHolder, ModelViews};

/// Quién originó una acción.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    User,
    Reconciler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub name: &'static str,
    /// Id de la entidad sobre la que trabaja (job o tarea)
    pub id: String,
    pub trigger: Trigger,
    pub summary: String,
}

impl ActionDescriptor {
    pub fn new(
        name: &'static str,
        id: impl Into<String>,
        trigger: Trigger,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            name,
            id: id.into(),
            trigger,
            summary: summary.into(),
        }
    }
}

/// Unidad de trabajo del control loop.
///
/// `apply` puede hacer I/O (store, sustrato, placement) y devuelve los cambios
/// de modelo a aplicar. No toca los modelos directamente: el engine aplica
/// lo devuelto cuando la acción termina. Un `Err` no produce cambios.
#[async_trait]
pub trait ChangeAction: Send + Sync {
    fn descriptor(&self) -> &ActionDescriptor;

    async fn apply(&self, views: &ModelViews) -> Result<Vec<ModelActionHolder>>;
}

pub type BoxedChangeAction = Box<dyn ChangeAction>;
