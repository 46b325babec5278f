use cryptoki_sys::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Limits;
use crate::error::{TokenError, TokenResult};

/// Identifier for an object attribute (the numeric `CKA_*` value).
pub type AttributeType = CK_ATTRIBUTE_TYPE;

const ULONG_LEN: usize = std::mem::size_of::<CK_ULONG>();

/// How the raw bytes of an attribute are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    Bool,
    Ulong,
    Bytes,
    Date,
    Mechanisms,
}

// Sorted by attribute type; looked up with a binary search.
static ATTRIBUTE_KINDS: &[(AttributeType, AttributeKind)] = &[
    (CKA_CLASS, AttributeKind::Ulong),
    (CKA_TOKEN, AttributeKind::Bool),
    (CKA_PRIVATE, AttributeKind::Bool),
    (CKA_LABEL, AttributeKind::Bytes),
    (CKA_APPLICATION, AttributeKind::Bytes),
    (CKA_VALUE, AttributeKind::Bytes),
    (CKA_OBJECT_ID, AttributeKind::Bytes),
    (CKA_CERTIFICATE_TYPE, AttributeKind::Ulong),
    (CKA_ISSUER, AttributeKind::Bytes),
    (CKA_SERIAL_NUMBER, AttributeKind::Bytes),
    (CKA_TRUSTED, AttributeKind::Bool),
    (CKA_CERTIFICATE_CATEGORY, AttributeKind::Ulong),
    (CKA_URL, AttributeKind::Bytes),
    (CKA_HASH_OF_SUBJECT_PUBLIC_KEY, AttributeKind::Bytes),
    (CKA_HASH_OF_ISSUER_PUBLIC_KEY, AttributeKind::Bytes),
    (CKA_CHECK_VALUE, AttributeKind::Bytes),
    (CKA_KEY_TYPE, AttributeKind::Ulong),
    (CKA_SUBJECT, AttributeKind::Bytes),
    (CKA_ID, AttributeKind::Bytes),
    (CKA_SENSITIVE, AttributeKind::Bool),
    (CKA_ENCRYPT, AttributeKind::Bool),
    (CKA_DECRYPT, AttributeKind::Bool),
    (CKA_WRAP, AttributeKind::Bool),
    (CKA_UNWRAP, AttributeKind::Bool),
    (CKA_SIGN, AttributeKind::Bool),
    (CKA_SIGN_RECOVER, AttributeKind::Bool),
    (CKA_VERIFY, AttributeKind::Bool),
    (CKA_VERIFY_RECOVER, AttributeKind::Bool),
    (CKA_DERIVE, AttributeKind::Bool),
    (CKA_START_DATE, AttributeKind::Date),
    (CKA_END_DATE, AttributeKind::Date),
    (CKA_MODULUS, AttributeKind::Bytes),
    (CKA_MODULUS_BITS, AttributeKind::Ulong),
    (CKA_PUBLIC_EXPONENT, AttributeKind::Bytes),
    (CKA_PRIVATE_EXPONENT, AttributeKind::Bytes),
    (CKA_PRIME_1, AttributeKind::Bytes),
    (CKA_PRIME_2, AttributeKind::Bytes),
    (CKA_EXPONENT_1, AttributeKind::Bytes),
    (CKA_EXPONENT_2, AttributeKind::Bytes),
    (CKA_COEFFICIENT, AttributeKind::Bytes),
    (CKA_PUBLIC_KEY_INFO, AttributeKind::Bytes),
    (CKA_VALUE_BITS, AttributeKind::Ulong),
    (CKA_VALUE_LEN, AttributeKind::Ulong),
    (CKA_EXTRACTABLE, AttributeKind::Bool),
    (CKA_LOCAL, AttributeKind::Bool),
    (CKA_NEVER_EXTRACTABLE, AttributeKind::Bool),
    (CKA_ALWAYS_SENSITIVE, AttributeKind::Bool),
    (CKA_KEY_GEN_MECHANISM, AttributeKind::Ulong),
    (CKA_MODIFIABLE, AttributeKind::Bool),
    (CKA_COPYABLE, AttributeKind::Bool),
    (CKA_DESTROYABLE, AttributeKind::Bool),
    (CKA_EC_PARAMS, AttributeKind::Bytes),
    (CKA_EC_POINT, AttributeKind::Bytes),
    (CKA_ALWAYS_AUTHENTICATE, AttributeKind::Bool),
    (CKA_WRAP_WITH_TRUSTED, AttributeKind::Bool),
    (CKA_ALLOWED_MECHANISMS, AttributeKind::Mechanisms),
];

/// Look up how an attribute type is encoded. Unknown types return `None`.
pub fn kind_of(attribute: AttributeType) -> Option<AttributeKind> {
    ATTRIBUTE_KINDS
        .binary_search_by_key(&attribute, |(id, _)| *id)
        .ok()
        .map(|index| ATTRIBUTE_KINDS[index].1)
}

/// Supported attribute value representations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(tag = "type", content = "value")]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
    Mechanisms(Vec<CK_MECHANISM_TYPE>),
}

impl AttributeValue {
    /// Decode the raw bytes a caller supplied for `attribute`.
    pub fn parse(attribute: AttributeType, raw: &[u8]) -> TokenResult<Self> {
        let kind = kind_of(attribute).ok_or(TokenError::AttributeTypeInvalid(attribute))?;
        let invalid = || TokenError::AttributeValueInvalid(attribute);
        match kind {
            AttributeKind::Bool => match raw {
                [byte] => Ok(Self::Bool(*byte != 0)),
                _ => Err(invalid()),
            },
            AttributeKind::Ulong => {
                let bytes: [u8; ULONG_LEN] = raw.try_into().map_err(|_| invalid())?;
                Ok(Self::Ulong(CK_ULONG::from_ne_bytes(bytes)))
            }
            AttributeKind::Date => {
                if raw.is_empty() || (raw.len() == 8 && raw.iter().all(u8::is_ascii_digit)) {
                    Ok(Self::Bytes(raw.to_vec()))
                } else {
                    Err(invalid())
                }
            }
            AttributeKind::Bytes => Ok(Self::Bytes(raw.to_vec())),
            AttributeKind::Mechanisms => {
                if raw.len() % ULONG_LEN != 0 {
                    return Err(invalid());
                }
                let mut mechanisms = Vec::with_capacity(raw.len() / ULONG_LEN);
                for chunk in raw.chunks_exact(ULONG_LEN) {
                    let bytes: [u8; ULONG_LEN] = chunk.try_into().map_err(|_| invalid())?;
                    mechanisms.push(CK_ULONG::from_ne_bytes(bytes));
                }
                Ok(Self::Mechanisms(mechanisms))
            }
        }
    }

    /// Encode into the byte layout returned to callers.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Bool(value) => vec![u8::from(*value)],
            Self::Ulong(value) => value.to_ne_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Mechanisms(list) => list.iter().flat_map(|m| m.to_ne_bytes()).collect(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Ulong(_) => ULONG_LEN,
            Self::Bytes(bytes) => bytes.len(),
            Self::Mechanisms(list) => list.len() * ULONG_LEN,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ulong(&self) -> Option<CK_ULONG> {
        match self {
            Self::Ulong(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Caller-supplied attribute list, used both to create objects and to search.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeTemplate {
    entries: Vec<(AttributeType, AttributeValue)>,
}

impl AttributeTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a raw template, enforcing the entry cap and rejecting an
    /// attribute that appears twice with different values.
    pub fn parse(raw: &[(AttributeType, Vec<u8>)]) -> TokenResult<Self> {
        if raw.len() > Limits::MAX_TEMPLATE_ATTRIBUTES {
            return Err(TokenError::invalid(format!(
                "template has {} attributes, limit is {}",
                raw.len(),
                Limits::MAX_TEMPLATE_ATTRIBUTES
            )));
        }
        let mut template = Self::new();
        for (attribute, bytes) in raw {
            let value = AttributeValue::parse(*attribute, bytes)?;
            match template.get(*attribute) {
                Some(existing) if *existing != value => {
                    return Err(TokenError::TemplateInconsistent);
                }
                Some(_) => {}
                None => template.entries.push((*attribute, value)),
            }
        }
        Ok(template)
    }

    pub fn push(&mut self, id: AttributeType, value: AttributeValue) {
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.push((id, value));
    }

    pub fn with(mut self, id: AttributeType, value: AttributeValue) -> Self {
        self.push(id, value);
        self
    }

    pub fn entries(&self) -> &[(AttributeType, AttributeValue)] {
        &self.entries
    }

    pub fn get(&self, id: AttributeType) -> Option<&AttributeValue> {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, value)| value)
    }

    pub fn bool(&self, id: AttributeType) -> Option<bool> {
        self.get(id).and_then(AttributeValue::as_bool)
    }

    pub fn ulong(&self, id: AttributeType) -> Option<CK_ULONG> {
        self.get(id).and_then(AttributeValue::as_ulong)
    }

    pub fn bytes(&self, id: AttributeType) -> Option<&[u8]> {
        self.get(id).and_then(AttributeValue::as_bytes)
    }

    pub fn contains(&self, id: AttributeType) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered attribute map held by every object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(default)]
    entries: BTreeMap<AttributeType, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: AttributeType, value: AttributeValue) -> Option<AttributeValue> {
        self.entries.insert(id, value)
    }

    pub fn get(&self, id: AttributeType) -> Option<&AttributeValue> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: AttributeType) -> Option<AttributeValue> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: AttributeType) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttributeType, &AttributeValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bool_or(&self, id: AttributeType, default: bool) -> bool {
        self.get(id).and_then(AttributeValue::as_bool).unwrap_or(default)
    }

    pub fn ulong(&self, id: AttributeType) -> Option<CK_ULONG> {
        self.get(id).and_then(AttributeValue::as_ulong)
    }

    pub fn bytes(&self, id: AttributeType) -> Option<&[u8]> {
        self.get(id).and_then(AttributeValue::as_bytes)
    }

    /// Insert every template entry, replacing existing values.
    pub fn apply(&mut self, template: &AttributeTemplate) {
        for (id, value) in template.entries() {
            self.entries.insert(*id, value.clone());
        }
    }

    /// Insert `value` only when the attribute is absent.
    pub fn default_value(&mut self, id: AttributeType, value: AttributeValue) {
        self.entries.entry(id).or_insert(value);
    }

    /// Conjunctive match: every template attribute must be present with an
    /// identical value.
    pub fn matches_template(&self, template: &AttributeTemplate) -> bool {
        template
            .entries()
            .iter()
            .all(|(id, expected)| self.entries.get(id) == Some(expected))
    }

    pub fn encoded_len(&self) -> usize {
        self.entries
            .values()
            .map(|value| ULONG_LEN * 2 + value.encoded_len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ulong_bytes(value: CK_ULONG) -> Vec<u8> {
        value.to_ne_bytes().to_vec()
    }

    #[test]
    fn kind_table_is_sorted() {
        assert!(ATTRIBUTE_KINDS.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }

    #[test]
    fn parse_rejects_unknown_and_malformed_values() {
        assert_eq!(
            AttributeValue::parse(0x7fff_0000, &[1]),
            Err(TokenError::AttributeTypeInvalid(0x7fff_0000))
        );
        assert_eq!(
            AttributeValue::parse(CKA_TOKEN, &[1, 0]),
            Err(TokenError::AttributeValueInvalid(CKA_TOKEN))
        );
        assert_eq!(
            AttributeValue::parse(CKA_CLASS, &[1]),
            Err(TokenError::AttributeValueInvalid(CKA_CLASS))
        );
        assert_eq!(
            AttributeValue::parse(CKA_CLASS, &ulong_bytes(CKO_SECRET_KEY)),
            Ok(AttributeValue::Ulong(CKO_SECRET_KEY))
        );
    }

    #[test]
    fn template_cap_and_conflicts() {
        let oversized: Vec<(AttributeType, Vec<u8>)> = (0..=Limits::MAX_TEMPLATE_ATTRIBUTES)
            .map(|_| (CKA_LABEL, b"x".to_vec()))
            .collect();
        assert!(matches!(
            AttributeTemplate::parse(&oversized),
            Err(TokenError::ArgumentsBad(_))
        ));

        let conflicting = vec![(CKA_TOKEN, vec![1]), (CKA_TOKEN, vec![0])];
        assert_eq!(
            AttributeTemplate::parse(&conflicting),
            Err(TokenError::TemplateInconsistent)
        );

        let repeated = vec![(CKA_TOKEN, vec![1]), (CKA_TOKEN, vec![1])];
        let template = AttributeTemplate::parse(&repeated).expect("template");
        assert_eq!(template.len(), 1);
    }

    #[test]
    fn matches_template_is_a_conjunction() {
        let mut set = AttributeSet::new();
        set.insert(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY));
        set.insert(CKA_LABEL, AttributeValue::Bytes(b"alpha".to_vec()));

        let hit = AttributeTemplate::new()
            .with(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY))
            .with(CKA_LABEL, AttributeValue::Bytes(b"alpha".to_vec()));
        assert!(set.matches_template(&hit));

        let missing = hit.clone().with(CKA_ID, AttributeValue::Bytes(vec![1]));
        assert!(!set.matches_template(&missing));

        let wrong = AttributeTemplate::new().with(CKA_LABEL, AttributeValue::Bytes(b"beta".to_vec()));
        assert!(!set.matches_template(&wrong));
        assert!(set.matches_template(&AttributeTemplate::new()));
    }

    #[test]
    fn mechanism_lists_round_trip_through_raw_bytes() {
        let raw: Vec<u8> = [CKM_AES_CBC_PAD, CKM_AES_GCM]
            .iter()
            .flat_map(|m| m.to_ne_bytes())
            .collect();
        let value = AttributeValue::parse(CKA_ALLOWED_MECHANISMS, &raw).expect("parse");
        assert_eq!(
            value,
            AttributeValue::Mechanisms(vec![CKM_AES_CBC_PAD, CKM_AES_GCM])
        );
        assert_eq!(value.encode(), raw);
    }
}
