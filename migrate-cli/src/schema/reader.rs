//! Schema document parsing.
//!
//! Accepts both the canonical form and the legacy interchange form: type
//! tags are resolved through an alias table, and a `lookupentity` attribute
//! forces reference semantics even when no (or an unrecognized) type tag is
//! present.

use roxmltree::{Document, Node};

use crate::error::MigrationError;
use crate::schema::model::{EntityDescriptor, FieldDescriptor, FieldType, RelationshipDescriptor, Schema};

/// Resolve a field's declared type tag (plus optional `lookupentity`
/// attribute) into a [`FieldType`], applying the alias table from the
/// component design:
///
/// 1. explicit type tag, alias-mapped
/// 2. else, if `lookupentity` is present, `Reference`
/// 3. else, `String`
pub fn resolve_field_type(type_attr: Option<&str>, lookup_entity: Option<&str>) -> FieldType {
    if let Some(tag) = type_attr {
        if let Some(resolved) = alias_lookup(tag) {
            return resolved;
        }
    }
    if lookup_entity.is_some() {
        return FieldType::Reference;
    }
    FieldType::String
}

fn alias_lookup(tag: &str) -> Option<FieldType> {
    let lowered = tag.to_ascii_lowercase();
    Some(match lowered.as_str() {
        "string" => FieldType::String,
        "memo" => FieldType::Memo,
        "number" | "int" | "integer" => FieldType::Int,
        "bigint" => FieldType::BigInt,
        "decimal" => FieldType::Decimal,
        "money" => FieldType::Money,
        "double" | "float" => FieldType::Double,
        "boolean" => FieldType::Boolean,
        "datetime" => FieldType::DateTime,
        "guid" | "uniqueidentifier" => FieldType::Guid,
        "lookup" | "entityreference" => FieldType::Reference,
        "optionset" | "picklist" => FieldType::OptionSet,
        "multi-optionset" => FieldType::MultiOptionSet,
        "state" => FieldType::State,
        "status" => FieldType::Status,
        "partylist" => FieldType::PartyList,
        _ => return None,
    })
}

/// Parse a schema document from its XML text.
pub fn parse_schema(xml: &str) -> Result<Schema, MigrationError> {
    let doc = Document::parse(xml)
        .map_err(|e| MigrationError::SchemaInvalid(format!("malformed XML: {e}")))?;

    let root = doc.root_element();
    if root.tag_name().name() != "entities" {
        return Err(MigrationError::SchemaInvalid(
            "root element must be <entities>".into(),
        ));
    }

    let mut entities = Vec::new();
    for entity_node in root.children().filter(|n| n.has_tag_name("entity")) {
        entities.push(parse_entity(entity_node)?);
    }

    let relationships = root
        .children()
        .find(|n| n.has_tag_name("relationships"))
        .map(parse_relationships)
        .transpose()?
        .unwrap_or_default();

    Ok(Schema {
        entities,
        relationships,
    })
}

fn parse_entity(node: Node) -> Result<EntityDescriptor, MigrationError> {
    let name = node
        .attribute("name")
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MigrationError::SchemaInvalid("entity missing non-empty name".into()))?;

    let fields_node = node
        .children()
        .find(|n| n.has_tag_name("fields"))
        .ok_or_else(|| MigrationError::SchemaInvalid(format!("entity '{name}' has no <fields>")))?;

    let mut fields = Vec::new();
    let mut primary_id_field = None;
    for field_node in fields_node.children().filter(|n| n.has_tag_name("field")) {
        let field = parse_field(field_node, &name)?;
        if field.field_type == FieldType::Guid && primary_id_field.is_none() {
            // The first guid-typed field declared is treated as the
            // primary id unless a later pass finds one named `<entity>id`.
            primary_id_field = Some(field.name.clone());
        }
        if field.name == format!("{name}id") {
            primary_id_field = Some(field.name.clone());
        }
        fields.push(field);
    }

    let primary_id_field = primary_id_field.unwrap_or_else(|| format!("{name}id"));

    Ok(EntityDescriptor {
        name,
        primary_id_field,
        fields,
    })
}

fn parse_field(node: Node, entity_name: &str) -> Result<FieldDescriptor, MigrationError> {
    let name = node
        .attribute("name")
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            MigrationError::SchemaInvalid(format!("entity '{entity_name}' has a field with no name"))
        })?;

    let lookup_entity = node.attribute("lookupentity").map(str::to_string);
    let field_type = resolve_field_type(node.attribute("type"), lookup_entity.as_deref());

    let is_create_valid = node
        .attribute("createvalid")
        .map(|v| v != "false")
        .unwrap_or(true);
    let is_update_valid = node
        .attribute("updatevalid")
        .map(|v| v != "false")
        .unwrap_or(true);

    Ok(FieldDescriptor {
        name,
        field_type,
        lookup_entity,
        is_create_valid,
        is_update_valid,
    })
}

fn parse_relationships(node: Node) -> Result<Vec<RelationshipDescriptor>, MigrationError> {
    let mut out = Vec::new();
    for rel in node.children().filter(|n| n.has_tag_name("relationship")) {
        let get = |attr: &str| -> Result<String, MigrationError> {
            rel.attribute(attr)
                .map(str::to_string)
                .ok_or_else(|| MigrationError::SchemaInvalid(format!("relationship missing '{attr}'")))
        };
        out.push(RelationshipDescriptor {
            intersect_entity: get("intersect")?,
            entity1: get("entity1")?,
            key1: get("key1")?,
            entity2: get("entity2")?,
            key2: get("key2")?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_legacy_aliases() {
        assert_eq!(resolve_field_type(Some("number"), None), FieldType::Int);
        assert_eq!(resolve_field_type(Some("bigint"), None), FieldType::BigInt);
        assert_eq!(
            resolve_field_type(Some("uniqueidentifier"), None),
            FieldType::Guid
        );
        assert_eq!(resolve_field_type(Some("partylist"), None), FieldType::PartyList);
    }

    #[test]
    fn lookupentity_forces_reference_without_type() {
        // Regression coverage for #187 behavior: a field with lookupentity
        // but no declared type tag is still a reference.
        assert_eq!(resolve_field_type(None, Some("account")), FieldType::Reference);
    }

    #[test]
    fn absent_type_and_lookup_defaults_to_string() {
        assert_eq!(resolve_field_type(None, None), FieldType::String);
    }

    #[test]
    fn parses_minimal_schema_with_relationship() {
        let xml = r#"
            <entities>
                <entity name="account">
                    <fields>
                        <field name="accountid" type="guid"/>
                        <field name="name" type="string"/>
                        <field name="primarycontactid" lookupentity="contact"/>
                    </fields>
                </entity>
                <entity name="contact">
                    <fields>
                        <field name="contactid" type="guid"/>
                        <field name="fullname" type="string"/>
                    </fields>
                </entity>
                <relationships>
                    <relationship intersect="accountcontact" entity1="account" entity2="contact" key1="accountid" key2="contactid"/>
                </relationships>
            </entities>
        "#;

        let schema = parse_schema(xml).unwrap();
        assert_eq!(schema.entities.len(), 2);
        let account = schema.entity("account").unwrap();
        assert_eq!(account.primary_id_field, "accountid");
        let lookup = account.field("primarycontactid").unwrap();
        assert_eq!(lookup.field_type, FieldType::Reference);
        assert_eq!(lookup.lookup_entity.as_deref(), Some("contact"));
        assert_eq!(schema.relationships.len(), 1);
    }

    #[test]
    fn rejects_empty_entity_name() {
        let xml = r#"<entities><entity name=""><fields><field name="x" type="string"/></fields></entity></entities>"#;
        assert!(matches!(
            parse_schema(xml),
            Err(MigrationError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn rejects_empty_field_name() {
        let xml = r#"<entities><entity name="account"><fields><field name="" type="string"/></fields></entity></entities>"#;
        assert!(matches!(
            parse_schema(xml),
            Err(MigrationError::SchemaInvalid(_))
        ));
    }
}
