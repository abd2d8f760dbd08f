use std::collections::BTreeSet;

use crate::{Aspect, FrozenState, Node, Properties, PropertyKey, TypeTag};

/// Version bookkeeping and ownership properties that never reach a record copy.
#[must_use]
pub fn is_record_excluded_property(key: &PropertyKey) -> bool {
    matches!(
        key,
        PropertyKey::RecordableVersionPolicy
            | PropertyKey::FilePlan
            | PropertyKey::AutoVersion
            | PropertyKey::AutoVersionOnUpdateProps
            | PropertyKey::VersionType
            | PropertyKey::VersionLabel
            | PropertyKey::Owner
    )
}

#[must_use]
pub fn is_record_excluded_aspect(aspect: &Aspect) -> bool {
    matches!(aspect, Aspect::Versionable | Aspect::RecordableVersionable)
}

/// Properties compared when deciding whether a document has changed since its last version.
#[must_use]
pub fn is_content_property(key: &PropertyKey) -> bool {
    !matches!(
        key,
        PropertyKey::Modified
            | PropertyKey::Modifier
            | PropertyKey::Accessed
            | PropertyKey::VersionLabel
            | PropertyKey::VersionType
            | PropertyKey::AutoVersion
            | PropertyKey::AutoVersionOnUpdateProps
            | PropertyKey::RecordableVersionPolicy
            | PropertyKey::FilePlan
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCopy {
    pub type_tag: TypeTag,
    pub aspects: BTreeSet<Aspect>,
    pub properties: Properties,
}

#[must_use]
pub fn record_copy_of(frozen: &FrozenState) -> RecordCopy {
    RecordCopy {
        type_tag: frozen.type_tag,
        aspects: frozen
            .aspects
            .iter()
            .filter(|aspect| !is_record_excluded_aspect(aspect))
            .cloned()
            .collect(),
        properties: frozen
            .properties
            .iter()
            .filter(|(key, _)| !is_record_excluded_property(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

#[must_use]
pub fn content_differs(document: &Node, frozen: &FrozenState) -> bool {
    let live = document
        .properties
        .iter()
        .filter(|(key, _)| is_content_property(key));
    let snapshot = frozen
        .properties
        .iter()
        .filter(|(key, _)| is_content_property(key));
    !live.eq(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeRef, Value};

    fn frozen() -> FrozenState {
        let mut properties = Properties::new();
        properties.insert(PropertyKey::Name, Value::from("plan.txt"));
        properties.insert(PropertyKey::Content, Value::from("draft"));
        properties.insert(PropertyKey::Owner, Value::from("alice"));
        properties.insert(PropertyKey::RecordableVersionPolicy, Value::from("ALL"));
        properties.insert(PropertyKey::FilePlan, Value::Node(NodeRef::new()));
        properties.insert(PropertyKey::AutoVersion, Value::from(true));
        properties.insert(PropertyKey::VersionLabel, Value::from("1.0"));
        properties.insert(PropertyKey::Custom("acme:ref".to_string()), Value::from("X-1"));
        FrozenState {
            type_tag: TypeTag::Content,
            aspects: BTreeSet::from([
                Aspect::Versionable,
                Aspect::RecordableVersionable,
                Aspect::Titled,
                Aspect::Custom("acme:invoice".to_string()),
            ]),
            properties,
        }
    }

    #[test]
    fn record_copy_drops_bookkeeping_and_versioning_aspects() {
        let copy = record_copy_of(&frozen());
        assert_eq!(copy.type_tag, TypeTag::Content);
        assert_eq!(
            copy.aspects,
            BTreeSet::from([Aspect::Titled, Aspect::Custom("acme:invoice".to_string())])
        );
        let keys: Vec<_> = copy.properties.keys().map(PropertyKey::as_str).collect();
        assert_eq!(keys, vec!["name", "content", "acme:ref"]);
    }

    #[test]
    fn audit_changes_do_not_make_a_document_dirty() {
        let snapshot = frozen();
        let mut document = Node {
            node_ref: NodeRef::new(),
            type_tag: TypeTag::Content,
            aspects: snapshot.aspects.clone(),
            properties: snapshot.properties.clone(),
        };
        assert!(!content_differs(&document, &snapshot));

        document
            .properties
            .insert(PropertyKey::Modifier, Value::from("bob"));
        document
            .properties
            .insert(PropertyKey::VersionLabel, Value::from("1.1"));
        assert!(!content_differs(&document, &snapshot));

        document
            .properties
            .insert(PropertyKey::Content, Value::from("final"));
        assert!(content_differs(&document, &snapshot));
    }

    #[test]
    fn removed_content_property_counts_as_dirty() {
        let snapshot = frozen();
        let mut properties = snapshot.properties.clone();
        properties.remove(&PropertyKey::Custom("acme:ref".to_string()));
        let document = Node {
            node_ref: NodeRef::new(),
            type_tag: TypeTag::Content,
            aspects: snapshot.aspects.clone(),
            properties,
        };
        assert!(content_differs(&document, &snapshot));
    }
}
