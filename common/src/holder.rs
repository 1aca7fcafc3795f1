use std::collections::BTreeMap;
use std::sync::Arc;

use crate::call_metadata::CallMetadata;

/// Valor tipado de un tag de holder.
///
/// Los tags llevan metadatos transversales (auditoría, contadores de
/// reintento) que no son parte de la entidad de dominio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolderTag {
    Millis(i64),
    Count(u32),
    Flag(bool),
    Text(String),
    CallMetadata(CallMetadata),
}

/// Contenedor inmutable: (entidad, hijos ordenados, tags).
///
/// Todos los "mutadores" devuelven un holder nuevo; el anterior sigue siendo
/// válido. Internamente se comparte estructura con `Arc`, así que clonar un
/// árbol es barato y los tres modelos de un job nunca se pisan entre sí.
#[derive(Debug, Clone)]
pub struct EntityHolder<E> {
    id: String,
    entity: Arc<E>,
    children: Arc<Vec<EntityHolder<E>>>,
    tags: Arc<BTreeMap<String, HolderTag>>,
}

impl<E: Clone> EntityHolder<E> {
    pub fn new_root(id: impl Into<String>, entity: E) -> Self {
        Self {
            id: id.into(),
            entity: Arc::new(entity),
            children: Arc::new(Vec::new()),
            tags: Arc::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn children(&self) -> &[EntityHolder<E>] {
        &self.children
    }

    /// Busca el holder con ese id en todo el subárbol (incluida la raíz).
    pub fn find_by_id(&self, id: &str) -> Option<&EntityHolder<E>> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find_by_id(id))
    }

    pub fn find_child_by_id(&self, id: &str) -> Option<&EntityHolder<E>> {
        self.children.iter().find(|child| child.id == id)
    }

    /// Agrega un hijo; si ya hay uno con el mismo id lo reemplaza en su posición.
    pub fn add_child(&self, child: EntityHolder<E>) -> Self {
        let mut children = self.children.as_ref().clone();
        match children.iter().position(|c| c.id == child.id) {
            Some(pos) => children[pos] = child,
            None => children.push(child),
        }
        Self {
            children: Arc::new(children),
            ..self.clone()
        }
    }

    /// Devuelve la nueva raíz y el hijo removido (si existía).
    pub fn remove_child(&self, id: &str) -> (Self, Option<EntityHolder<E>>) {
        let mut children = self.children.as_ref().clone();
        let removed = children
            .iter()
            .position(|c| c.id == id)
            .map(|pos| children.remove(pos));
        let root = Self {
            children: Arc::new(children),
            ..self.clone()
        };
        (root, removed)
    }

    pub fn set_entity(&self, entity: E) -> Self {
        Self {
            entity: Arc::new(entity),
            ..self.clone()
        }
    }

    pub fn add_tag(&self, key: impl Into<String>, value: HolderTag) -> Self {
        let mut tags = self.tags.as_ref().clone();
        tags.insert(key.into(), value);
        Self {
            tags: Arc::new(tags),
            ..self.clone()
        }
    }

    pub fn remove_tag(&self, key: &str) -> Self {
        if !self.tags.contains_key(key) {
            return self.clone();
        }
        let mut tags = self.tags.as_ref().clone();
        tags.remove(key);
        Self {
            tags: Arc::new(tags),
            ..self.clone()
        }
    }

    pub fn tag(&self, key: &str) -> Option<&HolderTag> {
        self.tags.get(key)
    }

    pub fn millis_tag(&self, key: &str) -> Option<i64> {
        match self.tags.get(key) {
            Some(HolderTag::Millis(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn count_tag(&self, key: &str) -> Option<u32> {
        match self.tags.get(key) {
            Some(HolderTag::Count(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn flag_tag(&self, key: &str) -> bool {
        matches!(self.tags.get(key), Some(HolderTag::Flag(true)))
    }
}

/// Igualdad estructural profunda de las entidades; los tags no cuentan.
impl<E: PartialEq> PartialEq for EntityHolder<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.entity == other.entity && self.children == other.children
    }
}

impl<E: Eq> Eq for EntityHolder<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> EntityHolder<String> {
        EntityHolder::new_root("root", "r".to_string())
            .add_child(EntityHolder::new_root("a", "A".to_string()))
            .add_child(EntityHolder::new_root("b", "B".to_string()))
    }

    #[test]
    fn mutadores_no_tocan_el_holder_original() {
        let original = tree();
        let changed = original.set_entity("r2".to_string());
        let tagged = original.add_tag("x", HolderTag::Count(1));

        assert_eq!(original.entity(), "r");
        assert_eq!(changed.entity(), "r2");
        assert!(original.tag("x").is_none());
        assert_eq!(tagged.count_tag("x"), Some(1));
    }

    #[test]
    fn add_child_reemplaza_por_id_conservando_orden() {
        let root = tree().add_child(EntityHolder::new_root("a", "A2".to_string()));
        let ids: Vec<&str> = root.children().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(root.find_child_by_id("a").unwrap().entity(), "A2");
    }

    #[test]
    fn remove_child_devuelve_el_removido() {
        let (root, removed) = tree().remove_child("a");
        assert_eq!(removed.unwrap().entity(), "A");
        assert_eq!(root.children().len(), 1);

        let (same, none) = root.remove_child("zzz");
        assert!(none.is_none());
        assert_eq!(same, root);
    }

    #[test]
    fn find_by_id_recorre_raiz_e_hijos() {
        let root = tree();
        assert_eq!(root.find_by_id("root").unwrap().entity(), "r");
        assert_eq!(root.find_by_id("b").unwrap().entity(), "B");
        assert!(root.find_by_id("c").is_none());
    }

    #[test]
    fn igualdad_ignora_tags_pero_no_hijos() {
        let a = tree();
        let b = tree().add_tag("retry", HolderTag::Millis(10));
        assert_eq!(a, b);

        let c = tree().add_child(EntityHolder::new_root("c", "C".to_string()));
        assert_ne!(a, c);
    }
}
