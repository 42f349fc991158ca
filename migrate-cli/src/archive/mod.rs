//! Archive codec (C2): reads/writes the ZIP bundle containing
//! `data_schema.xml` and one `{entity}/data.xml` per exported entity.
//!
//! The writer buffers each entity's XML in memory behind a per-entity
//! lock (so concurrent exporters can append pages without stepping on each
//! other) and only serializes into the underlying ZIP file — which, being
//! a single sequential container, cannot have two open entries written to
//! at once — at `finish()`, in deterministic (schema-first, then
//! entity-name-ascending) order. The reader opens entries lazily and
//! tolerates entities present in the schema but absent from the archive.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::MigrationError;
use crate::record::Record;
use crate::schema::model::EntityDescriptor;
use crate::value::{codec, RawField};

const SCHEMA_ENTRY: &str = "data_schema.xml";

#[derive(Default)]
struct EntityBuffer {
    records_xml: String,
    associations: HashMap<String, Vec<(Uuid, Uuid)>>,
}

/// Accumulates one entity's records and associations before the archive is
/// finalized.
pub struct EntitySink {
    name: String,
    buffer: std::sync::Arc<Mutex<EntityBuffer>>,
}

impl EntitySink {
    /// Append a page of records, encoding each through the value codec.
    pub fn append_records(
        &self,
        records: &[Record],
        entity: &EntityDescriptor,
    ) -> Result<(), MigrationError> {
        let mut xml = Vec::new();
        {
            let mut writer = Writer::new(&mut xml);
            for record in records {
                write_record(&mut writer, record, entity)?;
            }
        }
        let mut buffer = self.buffer.lock().unwrap();
        buffer
            .records_xml
            .push_str(std::str::from_utf8(&xml).unwrap());
        Ok(())
    }

    /// Append a page of M:N association pairs for `relationship_name`.
    pub fn append_associations(&self, relationship_name: &str, pairs: &[(Uuid, Uuid)]) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer
            .associations
            .entry(relationship_name.to_string())
            .or_default()
            .extend_from_slice(pairs);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn write_record(
    writer: &mut Writer<&mut Vec<u8>>,
    record: &Record,
    entity: &EntityDescriptor,
) -> Result<(), MigrationError> {
    let mut start = BytesStart::new("record");
    start.push_attribute(("id", record.id.hyphenated().to_string().as_str()));
    writer
        .write_event(Event::Start(start))
        .map_err(xml_err)?;

    for (field_name, value) in &record.fields {
        write_field(writer, field_name, value, entity)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("record")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_field(
    writer: &mut Writer<&mut Vec<u8>>,
    field_name: &str,
    value: &crate::value::Value,
    entity: &EntityDescriptor,
) -> Result<(), MigrationError> {
    use crate::value::Value;

    if let Value::PartyList(parties) = value {
        let mut start = BytesStart::new("field");
        start.push_attribute(("name", field_name));
        writer.write_event(Event::Start(start)).map_err(xml_err)?;
        for party in parties {
            let mut ap = BytesStart::new("activityparty");
            ap.push_attribute(("lookupentity", party.entity.as_str()));
            writer.write_event(Event::Start(ap)).map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(
                    &party.id.hyphenated().to_string(),
                )))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("activityparty")))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("field")))
            .map_err(xml_err)?;
        return Ok(());
    }

    let encoded = codec::encode(value);
    let mut start = BytesStart::new("field");
    start.push_attribute(("name", field_name));
    if let Some(lookup) = &encoded.lookup_entity {
        start.push_attribute(("lookupentity", lookup.as_str()));
    }
    if encoded.is_null {
        start.push_attribute(("isNull", "true"));
    }

    let _ = entity; // entity reserved for future schema cross-checks on write
    match &encoded.text {
        Some(text) => {
            writer.write_event(Event::Start(start)).map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("field")))
                .map_err(xml_err)?;
        }
        None => {
            writer
                .write_event(Event::Empty(start))
                .map_err(xml_err)?;
        }
    }
    Ok(())
}

fn xml_err(e: quick_xml::Error) -> MigrationError {
    MigrationError::Archive(format!("xml write error: {e}"))
}

/// Writes an [`crate::schema::model::Schema`]-described bundle to a ZIP
/// file at `path`.
pub struct ArchiveWriter {
    path: std::path::PathBuf,
    schema_xml: String,
    sinks: BTreeMap<String, EntitySink>,
}

impl ArchiveWriter {
    pub fn new(path: impl AsRef<Path>, schema_xml: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            schema_xml: schema_xml.into(),
            sinks: BTreeMap::new(),
        }
    }

    /// Get or create the sink for `entity`. Safe to call from multiple
    /// concurrent exporter tasks; each entity gets exactly one sink.
    pub fn entity_sink(&mut self, entity: &str) -> &EntitySink {
        self.sinks.entry(entity.to_string()).or_insert_with(|| EntitySink {
            name: entity.to_string(),
            buffer: std::sync::Arc::new(Mutex::new(EntityBuffer::default())),
        })
    }

    /// Finalize the archive: write `data_schema.xml` first, then each
    /// entity directory in logical-name order.
    pub fn finish(self) -> Result<(), MigrationError> {
        let file = File::create(&self.path)
            .map_err(|e| MigrationError::Archive(format!("cannot create {:?}: {e}", self.path)))?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        zip.start_file(SCHEMA_ENTRY, options)
            .map_err(zip_err)?;
        zip.write_all(self.schema_xml.as_bytes())
            .map_err(|e| MigrationError::Archive(e.to_string()))?;

        for (name, sink) in &self.sinks {
            let buffer = sink.buffer.lock().unwrap();
            let xml = render_entity_xml(name, &buffer);
            let entry = format!("{name}/data.xml");
            zip.start_file(&entry, options).map_err(zip_err)?;
            zip.write_all(xml.as_bytes())
                .map_err(|e| MigrationError::Archive(e.to_string()))?;
        }

        zip.finish().map_err(zip_err)?;
        Ok(())
    }
}

fn zip_err(e: zip::result::ZipError) -> MigrationError {
    MigrationError::Archive(format!("zip error: {e}"))
}

fn render_entity_xml(name: &str, buffer: &EntityBuffer) -> String {
    let mut out = String::new();
    out.push_str("<entities><entity name=\"");
    out.push_str(&xml_escape(name));
    out.push_str("\"><records>");
    out.push_str(&buffer.records_xml);
    out.push_str("</records>");

    if !buffer.associations.is_empty() {
        out.push_str("<m2mrelationships>");
        let mut names: Vec<_> = buffer.associations.keys().collect();
        names.sort();
        for rel_name in names {
            out.push_str("<relationship name=\"");
            out.push_str(&xml_escape(rel_name));
            out.push_str("\">");
            for (source, target) in &buffer.associations[rel_name] {
                out.push_str(&format!(
                    "<association sourceid=\"{}\" targetid=\"{}\"/>",
                    source.hyphenated(),
                    target.hyphenated()
                ));
            }
            out.push_str("</relationship>");
        }
        out.push_str("</m2mrelationships>");
    }

    out.push_str("</entity></entities>");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// A parsed entity section: its records plus M:N associations grouped by
/// relationship name.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    pub records: Vec<Record>,
    pub associations: HashMap<String, Vec<(Uuid, Uuid)>>,
}

/// Lazily-opening ZIP reader.
pub struct ArchiveReader {
    archive: ZipArchive<File>,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let file = File::open(path.as_ref())
            .map_err(|e| MigrationError::Archive(format!("cannot open archive: {e}")))?;
        let archive = ZipArchive::new(file).map_err(zip_err)?;
        Ok(Self { archive })
    }

    pub fn read_schema_xml(&mut self) -> Result<String, MigrationError> {
        let mut entry = self.archive.by_name(SCHEMA_ENTRY).map_err(zip_err)?;
        let mut s = String::new();
        entry
            .read_to_string(&mut s)
            .map_err(|e| MigrationError::Archive(e.to_string()))?;
        Ok(s)
    }

    /// Entity names present as directories in the archive, independent of
    /// what the schema declares (used to detect `SchemaMismatch` for
    /// entities present in the archive but missing from the schema).
    pub fn entities_present(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .archive
            .file_names()
            .filter_map(|n| n.strip_suffix("/data.xml").map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Read and parse `{entity}/data.xml`, decoding record fields through
    /// the given entity descriptor. Returns `None` if the entity has no
    /// directory in the archive (caller should treat as "skip with
    /// warning").
    pub fn read_entity(
        &mut self,
        entity: &EntityDescriptor,
    ) -> Result<Option<EntityData>, MigrationError> {
        let entry_name = format!("{}/data.xml", entity.name);
        let mut entry = match self.archive.by_name(&entry_name) {
            Ok(e) => e,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(zip_err(e)),
        };
        let mut xml = String::new();
        entry
            .read_to_string(&mut xml)
            .map_err(|e| MigrationError::Archive(e.to_string()))?;
        drop(entry);
        parse_entity_xml(&xml, entity).map(Some)
    }
}

fn parse_entity_xml(xml: &str, entity: &EntityDescriptor) -> Result<EntityData, MigrationError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut data = EntityData::default();
    let mut buf = Vec::new();

    let mut current_record: Option<Record> = None;
    let mut current_field: Option<(String, Option<String>, bool)> = None; // name, lookupentity, isNull
    let mut current_field_text = String::new();
    let mut current_relationship: Option<String> = None;
    let mut party_refs: Vec<crate::value::Reference> = Vec::new();
    let mut current_party_entity: Option<String> = None;
    let mut current_party_text = String::new();
    let mut in_party = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "record" => {
                        let id = attr(&e, "id")
                            .and_then(|v| Uuid::parse_str(&v).ok())
                            .ok_or_else(|| {
                                MigrationError::Archive("record missing id".into())
                            })?;
                        current_record = Some(Record::new(id));
                    }
                    "field" => {
                        let fname = attr(&e, "name").ok_or_else(|| {
                            MigrationError::Archive("field missing name".into())
                        })?;
                        let lookup = attr(&e, "lookupentity");
                        let is_null = attr(&e, "isNull").as_deref() == Some("true");
                        current_field = Some((fname, lookup, is_null));
                        current_field_text.clear();
                        party_refs.clear();
                    }
                    "activityparty" => {
                        in_party = true;
                        current_party_entity = attr(&e, "lookupentity");
                        current_party_text.clear();
                    }
                    "relationship" => {
                        current_relationship = attr(&e, "name");
                    }
                    "association" => {
                        let source = attr(&e, "sourceid").and_then(|v| Uuid::parse_str(&v).ok());
                        let target = attr(&e, "targetid").and_then(|v| Uuid::parse_str(&v).ok());
                        if let (Some(s), Some(t), Some(rel)) =
                            (source, target, current_relationship.clone())
                        {
                            data.associations.entry(rel).or_default().push((s, t));
                        }
                    }
                    _ => {}
                }
            }
            // Self-closing tags (`<field .../>`) never produce a matching
            // `Event::End`, so a field with no text content — every `isNull`
            // field the writer emits — has to be finalized right here rather
            // than falling through to the `Event::End` "field" arm below.
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "field" => {
                        let fname = attr(&e, "name").ok_or_else(|| {
                            MigrationError::Archive("field missing name".into())
                        })?;
                        let lookup = attr(&e, "lookupentity");
                        let is_null = attr(&e, "isNull").as_deref() == Some("true");
                        let field_desc = entity.field(&fname);
                        let field_type = field_desc
                            .map(|f| f.field_type)
                            .unwrap_or(crate::schema::model::FieldType::String);
                        let declared_lookup = field_desc.and_then(|f| f.lookup_entity.as_deref());
                        let raw = RawField {
                            text: None,
                            lookup_entity: lookup.as_deref(),
                            is_null,
                        };
                        let value =
                            codec::decode(&raw, field_type, declared_lookup, &entity.name, &fname)?;
                        if let Some(record) = current_record.as_mut() {
                            record.fields.insert(fname, value);
                        }
                    }
                    "association" => {
                        let source = attr(&e, "sourceid").and_then(|v| Uuid::parse_str(&v).ok());
                        let target = attr(&e, "targetid").and_then(|v| Uuid::parse_str(&v).ok());
                        if let (Some(s), Some(t), Some(rel)) =
                            (source, target, current_relationship.clone())
                        {
                            data.associations.entry(rel).or_default().push((s, t));
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(xml_err)?.to_string();
                if in_party {
                    current_party_text.push_str(&text);
                } else {
                    current_field_text.push_str(&text);
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "activityparty" => {
                        if let (Some(entity_name), Ok(id)) = (
                            current_party_entity.take(),
                            Uuid::parse_str(current_party_text.trim()),
                        ) {
                            party_refs.push(crate::value::Reference::new(entity_name, id));
                        }
                        in_party = false;
                    }
                    "field" => {
                        if let Some((fname, lookup, is_null)) = current_field.take() {
                            let field_desc = entity.field(&fname);
                            let field_type = field_desc
                                .map(|f| f.field_type)
                                .unwrap_or(crate::schema::model::FieldType::String);
                            let declared_lookup =
                                field_desc.and_then(|f| f.lookup_entity.as_deref());

                            let value = if !party_refs.is_empty() {
                                crate::value::Value::PartyList(std::mem::take(&mut party_refs))
                            } else {
                                let raw = RawField {
                                    text: if current_field_text.is_empty() {
                                        None
                                    } else {
                                        Some(current_field_text.as_str())
                                    },
                                    lookup_entity: lookup.as_deref(),
                                    is_null,
                                };
                                codec::decode(&raw, field_type, declared_lookup, &entity.name, &fname)?
                            };

                            if let Some(record) = current_record.as_mut() {
                                record.fields.insert(fname, value);
                            }
                        }
                    }
                    "record" => {
                        if let Some(record) = current_record.take() {
                            data.records.push(record);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(data)
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{EntityDescriptor, FieldDescriptor, FieldType};
    use crate::value::Value;

    fn account_entity() -> EntityDescriptor {
        EntityDescriptor {
            name: "account".into(),
            primary_id_field: "accountid".into(),
            fields: vec![
                FieldDescriptor {
                    name: "name".into(),
                    field_type: FieldType::String,
                    lookup_entity: None,
                    is_create_valid: true,
                    is_update_valid: true,
                },
                FieldDescriptor {
                    name: "primarycontactid".into(),
                    field_type: FieldType::Reference,
                    lookup_entity: Some("contact".into()),
                    is_create_valid: true,
                    is_update_valid: true,
                },
            ],
        }
    }

    #[test]
    fn writes_and_reads_back_records_and_associations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");

        let mut writer = ArchiveWriter::new(&path, "<entities></entities>");
        let entity = account_entity();
        let id1 = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let id2 = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();
        let contact_id = Uuid::parse_str("33333333-3333-3333-3333-333333333333").unwrap();

        {
            let sink = writer.entity_sink("account");
            let rec1 = Record::new(id1)
                .with_field("name", Value::String("Acme".into()))
                .with_field(
                    "primarycontactid",
                    Value::Reference(crate::value::Reference::new("contact", contact_id)),
                );
            let rec2 = Record::new(id2).with_field("name", Value::Null);
            sink.append_records(&[rec1, rec2], &entity).unwrap();
            sink.append_associations("accountcontact", &[(id1, contact_id)]);
        }

        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.read_schema_xml().unwrap(), "<entities></entities>");
        assert_eq!(reader.entities_present(), vec!["account".to_string()]);

        let data = reader.read_entity(&entity).unwrap().unwrap();
        assert_eq!(data.records.len(), 2);
        let r1 = data.records.iter().find(|r| r.id == id1).unwrap();
        assert_eq!(r1.get("name"), Some(&Value::String("Acme".into())));
        match r1.get("primarycontactid") {
            Some(Value::Reference(r)) => {
                assert_eq!(r.entity, "contact");
                assert_eq!(r.id, contact_id);
            }
            other => panic!("unexpected value: {other:?}"),
        }
        let r2 = data.records.iter().find(|r| r.id == id2).unwrap();
        assert_eq!(r2.get("name"), Some(&Value::Null));

        let assoc = data.associations.get("accountcontact").unwrap();
        assert_eq!(assoc, &vec![(id1, contact_id)]);
    }

    #[test]
    fn self_closing_null_field_is_read_back_as_null() {
        // rec2's "name" field has no text, so the writer emits a
        // self-closing `<field isNull="true"/>`; the reader must still
        // surface it as a field, not silently drop it.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        let mut writer = ArchiveWriter::new(&path, "<entities></entities>");
        let entity = account_entity();
        let id = Uuid::parse_str("44444444-4444-4444-4444-444444444444").unwrap();
        {
            let sink = writer.entity_sink("account");
            let rec = Record::new(id).with_field("name", Value::Null);
            sink.append_records(&[rec], &entity).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let data = reader.read_entity(&entity).unwrap().unwrap();
        let record = data.records.iter().find(|r| r.id == id).unwrap();
        assert_eq!(record.get("name"), Some(&Value::Null));
    }

    #[test]
    fn missing_entity_directory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        let writer = ArchiveWriter::new(&path, "<entities></entities>");
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let entity = account_entity();
        assert!(reader.read_entity(&entity).unwrap().is_none());
    }

    #[test]
    fn boolean_values_are_emitted_capitalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        let mut writer = ArchiveWriter::new(&path, "<entities></entities>");
        let entity = EntityDescriptor {
            name: "flag".into(),
            primary_id_field: "flagid".into(),
            fields: vec![FieldDescriptor {
                name: "active".into(),
                field_type: FieldType::Boolean,
                lookup_entity: None,
                is_create_valid: true,
                is_update_valid: true,
            }],
        };
        {
            let sink = writer.entity_sink("flag");
            let rec = Record::new(Uuid::nil()).with_field("active", Value::Bool(true));
            sink.append_records(&[rec], &entity).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let raw_xml = {
            let mut zf = reader.archive.by_name("flag/data.xml").unwrap();
            let mut s = String::new();
            zf.read_to_string(&mut s).unwrap();
            s
        };
        assert!(raw_xml.contains(">True<"));
    }
}
