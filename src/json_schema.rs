//! JSON Schema generation for the YAML document types users author by
//! hand: config, plan files, and fixtures. Editors wire these up for
//! completion and validation.

use schemars::schema::{RootSchema, Schema, SchemaObject, SingleOrVec};
use schemars::schema_for;
use std::collections::BTreeMap;

/// Formats schemars emits for Rust numerics that are not part of JSON
/// Schema Draft-07 and trip strict validators.
const NONSTANDARD_FORMATS: &[&str] = &[
    "uint", "uint8", "uint16", "uint32", "uint64", "int8", "int16", "int32", "int64", "float",
    "double",
];

/// All exported schemas, keyed by document name. BTreeMap keeps the
/// output diffable.
pub fn all_schemas() -> BTreeMap<&'static str, RootSchema> {
    let mut schemas = BTreeMap::new();
    schemas.insert("config", clean_schema(schema_for!(crate::config::RegressConfig)));
    schemas.insert("plan", clean_schema(schema_for!(crate::plan::Plan)));
    schemas.insert("fixture", clean_schema(schema_for!(crate::fixtures::Fixture)));
    schemas
}

pub fn get_schema(name: &str) -> Option<RootSchema> {
    all_schemas().remove(name)
}

pub fn schema_names() -> Vec<&'static str> {
    all_schemas().keys().copied().collect()
}

fn clean_schema(mut schema: RootSchema) -> RootSchema {
    clean_object(&mut schema.schema);
    for definition in schema.definitions.values_mut() {
        if let Schema::Object(obj) = definition {
            clean_object(obj);
        }
    }
    schema
}

/// Strip non-standard numeric formats, recursively.
fn clean_object(obj: &mut SchemaObject) {
    if let Some(format) = &obj.format {
        if NONSTANDARD_FORMATS.contains(&format.as_str()) {
            obj.format = None;
        }
    }

    if let Some(object) = &mut obj.object {
        for prop in object
            .properties
            .values_mut()
            .chain(object.pattern_properties.values_mut())
        {
            clean_schema_ref(prop);
        }
        if let Some(additional) = object.additional_properties.as_deref_mut() {
            clean_schema_ref(additional);
        }
    }

    if let Some(array) = &mut obj.array {
        match &mut array.items {
            Some(SingleOrVec::Single(item)) => clean_schema_ref(item),
            Some(SingleOrVec::Vec(items)) => items.iter_mut().for_each(clean_schema_ref),
            None => {}
        }
    }

    if let Some(subschemas) = &mut obj.subschemas {
        for group in [
            subschemas.all_of.as_mut(),
            subschemas.any_of.as_mut(),
            subschemas.one_of.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            group.iter_mut().for_each(clean_schema_ref);
        }
    }
}

fn clean_schema_ref(schema: &mut Schema) {
    if let Schema::Object(obj) = schema {
        clean_object(obj);
    }
}
