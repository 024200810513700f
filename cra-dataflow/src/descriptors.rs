//! # Descriptors
//!
//! String forms of operator inputs and type signatures. Both are stored in
//! compiled tasks and compared by workers before a function runs.
//!
//! Fields are joined with `:`. A null field is written as `$`; `%`, `:` and
//! `$` inside a field are percent-escaped, so Rust paths such as
//! `cra_dataflow::dataset::Dataset` survive the round trip.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

const FIELD_SEPARATOR: char = ':';
const NULL_FIELD: &str = "$";

/// Ids of the one or two datasets an operator consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorInputs {
    pub input_id1: Option<String>,
    pub input_id2: Option<String>,
}

impl OperatorInputs {
    pub fn unary(input: impl Into<String>) -> Self {
        Self {
            input_id1: Some(input.into()),
            input_id2: None,
        }
    }

    pub fn binary(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            input_id1: Some(left.into()),
            input_id2: Some(right.into()),
        }
    }
}

impl fmt::Display for OperatorInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_fields(&[
            self.input_id1.as_deref(),
            self.input_id2.as_deref(),
        ]))
    }
}

impl FromStr for OperatorInputs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let [input_id1, input_id2] = decode_fields::<2>(s)?;
        Ok(Self {
            input_id1,
            input_id2,
        })
    }
}

/// Type signature of a one-input operator. The empty string stands for a
/// signature with every field null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnaryOperatorTypes {
    pub input_key_type: Option<String>,
    pub input_payload_type: Option<String>,
    pub input_dataset_type: Option<String>,
    pub output_key_type: Option<String>,
    pub output_payload_type: Option<String>,
    pub output_dataset_type: Option<String>,
}

impl UnaryOperatorTypes {
    /// Signature whose input and output share key, payload and dataset types.
    pub fn uniform(key: &str, payload: &str, dataset: &str) -> Self {
        Self {
            input_key_type: Some(key.to_string()),
            input_payload_type: Some(payload.to_string()),
            input_dataset_type: Some(dataset.to_string()),
            output_key_type: Some(key.to_string()),
            output_payload_type: Some(payload.to_string()),
            output_dataset_type: Some(dataset.to_string()),
        }
    }

    fn fields(&self) -> [Option<&str>; 6] {
        [
            self.input_key_type.as_deref(),
            self.input_payload_type.as_deref(),
            self.input_dataset_type.as_deref(),
            self.output_key_type.as_deref(),
            self.output_payload_type.as_deref(),
            self.output_dataset_type.as_deref(),
        ]
    }
}

impl fmt::Display for UnaryOperatorTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields();
        if fields.iter().all(Option::is_none) {
            return Ok(());
        }
        f.write_str(&encode_fields(&fields))
    }
}

impl FromStr for UnaryOperatorTypes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let [
            input_key_type,
            input_payload_type,
            input_dataset_type,
            output_key_type,
            output_payload_type,
            output_dataset_type,
        ] = decode_fields::<6>(s)?;
        Ok(Self {
            input_key_type,
            input_payload_type,
            input_dataset_type,
            output_key_type,
            output_payload_type,
            output_dataset_type,
        })
    }
}

/// Type signature of a two-input operator: primary input, secondary input,
/// output. The empty string stands for a signature with every field null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryOperatorTypes {
    pub input_key_type: Option<String>,
    pub input_payload_type: Option<String>,
    pub input_dataset_type: Option<String>,
    pub secondary_key_type: Option<String>,
    pub secondary_payload_type: Option<String>,
    pub secondary_dataset_type: Option<String>,
    pub output_key_type: Option<String>,
    pub output_payload_type: Option<String>,
    pub output_dataset_type: Option<String>,
}

impl BinaryOperatorTypes {
    pub fn uniform(key: &str, payload: &str, dataset: &str) -> Self {
        Self {
            input_key_type: Some(key.to_string()),
            input_payload_type: Some(payload.to_string()),
            input_dataset_type: Some(dataset.to_string()),
            secondary_key_type: Some(key.to_string()),
            secondary_payload_type: Some(payload.to_string()),
            secondary_dataset_type: Some(dataset.to_string()),
            output_key_type: Some(key.to_string()),
            output_payload_type: Some(payload.to_string()),
            output_dataset_type: Some(dataset.to_string()),
        }
    }

    fn fields(&self) -> [Option<&str>; 9] {
        [
            self.input_key_type.as_deref(),
            self.input_payload_type.as_deref(),
            self.input_dataset_type.as_deref(),
            self.secondary_key_type.as_deref(),
            self.secondary_payload_type.as_deref(),
            self.secondary_dataset_type.as_deref(),
            self.output_key_type.as_deref(),
            self.output_payload_type.as_deref(),
            self.output_dataset_type.as_deref(),
        ]
    }
}

impl fmt::Display for BinaryOperatorTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields();
        if fields.iter().all(Option::is_none) {
            return Ok(());
        }
        f.write_str(&encode_fields(&fields))
    }
}

impl FromStr for BinaryOperatorTypes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let [
            input_key_type,
            input_payload_type,
            input_dataset_type,
            secondary_key_type,
            secondary_payload_type,
            secondary_dataset_type,
            output_key_type,
            output_payload_type,
            output_dataset_type,
        ] = decode_fields::<9>(s)?;
        Ok(Self {
            input_key_type,
            input_payload_type,
            input_dataset_type,
            secondary_key_type,
            secondary_payload_type,
            secondary_dataset_type,
            output_key_type,
            output_payload_type,
            output_dataset_type,
        })
    }
}

fn encode_fields(fields: &[Option<&str>]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        match field {
            Some(value) => escape_into(value, &mut out),
            None => out.push_str(NULL_FIELD),
        }
    }
    out
}

fn decode_fields<const N: usize>(s: &str) -> Result<[Option<String>; N]> {
    let parts: Vec<&str> = s.split(FIELD_SEPARATOR).collect();
    if parts.len() != N {
        return Err(anyhow!(
            "expected {} fields, found {} in {:?}",
            N,
            parts.len(),
            s
        ));
    }
    let mut fields: [Option<String>; N] = std::array::from_fn(|_| None);
    for (slot, part) in fields.iter_mut().zip(parts) {
        if part != NULL_FIELD {
            *slot = Some(unescape(part)?);
        }
    }
    Ok(fields)
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '$' => out.push_str("%24"),
            c => out.push(c),
        }
    }
}

fn unescape(field: &str) -> Result<String> {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 1..pos + 3)
            .ok_or_else(|| anyhow!("truncated escape in {:?}", field))?;
        out.push(match code {
            "25" => '%',
            "3A" => ':',
            "24" => '$',
            other => return Err(anyhow!("unknown escape %{} in {:?}", other, field)),
        });
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
#[path = "tests/descriptors_tests.rs"]
mod tests;
