//! Objects held by a token: their attribute policy, class defaults and the
//! rules governing creation, copy and modification.

use std::sync::Arc;

use cryptoki_sys::*;
use uuid::Uuid;

use crate::attributes::{AttributeSet, AttributeTemplate, AttributeType, AttributeValue};
use crate::crypto::{AesKey, KeyMaterial};
use crate::error::{TokenError, TokenResult};
use crate::handle::Handle;
use crate::slot::SlotId;

/// Who owns an object, and therefore how long it lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Token,
    Session(Handle),
}

pub struct Object {
    pub slot: SlotId,
    pub owner: Owner,
    pub attributes: AttributeSet,
    pub material: Option<Arc<KeyMaterial>>,
    /// Persistent identity of token objects in the backing store.
    pub store_id: Option<Uuid>,
}

/// Result of reading one attribute of an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeLookup {
    Value(Vec<u8>),
    Sensitive,
    Invalid,
}

impl Object {
    pub fn class(&self) -> CK_OBJECT_CLASS {
        self.attributes.ulong(CKA_CLASS).unwrap_or(CKO_DATA)
    }

    pub fn key_type(&self) -> Option<CK_KEY_TYPE> {
        self.attributes.ulong(CKA_KEY_TYPE)
    }

    pub fn is_token(&self) -> bool {
        self.owner == Owner::Token
    }

    pub fn is_private(&self) -> bool {
        self.attributes.bool_or(CKA_PRIVATE, false)
    }

    pub fn is_key(&self) -> bool {
        is_key_class(self.class())
    }

    /// Sensitive components are withheld when either flag protects them.
    pub fn protects_material(&self) -> bool {
        self.attributes.bool_or(CKA_SENSITIVE, false)
            || !self.attributes.bool_or(CKA_EXTRACTABLE, true)
    }

    pub fn lookup(&self, attribute: AttributeType) -> AttributeLookup {
        if let Some(value) = self.attributes.get(attribute) {
            return AttributeLookup::Value(value.encode());
        }
        let Some(material) = &self.material else {
            return AttributeLookup::Invalid;
        };
        match material
            .sensitive_attributes()
            .into_iter()
            .find(|(id, _)| *id == attribute)
        {
            Some(_) if self.protects_material() => AttributeLookup::Sensitive,
            Some((_, value)) => AttributeLookup::Value(value.encode()),
            None => AttributeLookup::Invalid,
        }
    }

    /// Approximate storage footprint in bytes.
    pub fn size(&self) -> usize {
        let material = self
            .material
            .as_ref()
            .map(|material| {
                material
                    .sensitive_attributes()
                    .iter()
                    .map(|(_, value)| value.encoded_len())
                    .sum()
            })
            .unwrap_or(0);
        self.attributes.encoded_len() + material
    }
}

pub fn is_key_class(class: CK_OBJECT_CLASS) -> bool {
    matches!(class, CKO_SECRET_KEY | CKO_PUBLIC_KEY | CKO_PRIVATE_KEY)
}

const COMMON: &[AttributeType] = &[
    CKA_CLASS,
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_MODIFIABLE,
    CKA_LABEL,
    CKA_COPYABLE,
    CKA_DESTROYABLE,
];

const DATA: &[AttributeType] = &[CKA_APPLICATION, CKA_OBJECT_ID, CKA_VALUE];

const CERTIFICATE: &[AttributeType] = &[
    CKA_CERTIFICATE_TYPE,
    CKA_TRUSTED,
    CKA_CERTIFICATE_CATEGORY,
    CKA_CHECK_VALUE,
    CKA_START_DATE,
    CKA_END_DATE,
    CKA_SUBJECT,
    CKA_ID,
    CKA_ISSUER,
    CKA_SERIAL_NUMBER,
    CKA_VALUE,
    CKA_URL,
    CKA_HASH_OF_SUBJECT_PUBLIC_KEY,
    CKA_HASH_OF_ISSUER_PUBLIC_KEY,
];

const KEY: &[AttributeType] = &[
    CKA_KEY_TYPE,
    CKA_ID,
    CKA_START_DATE,
    CKA_END_DATE,
    CKA_DERIVE,
    CKA_LOCAL,
    CKA_KEY_GEN_MECHANISM,
    CKA_ALLOWED_MECHANISMS,
];

const SECRET_KEY: &[AttributeType] = &[
    CKA_SENSITIVE,
    CKA_ENCRYPT,
    CKA_DECRYPT,
    CKA_SIGN,
    CKA_VERIFY,
    CKA_WRAP,
    CKA_UNWRAP,
    CKA_EXTRACTABLE,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_CHECK_VALUE,
    CKA_WRAP_WITH_TRUSTED,
    CKA_TRUSTED,
    CKA_VALUE,
    CKA_VALUE_LEN,
];

const PUBLIC_KEY: &[AttributeType] = &[
    CKA_SUBJECT,
    CKA_ENCRYPT,
    CKA_VERIFY,
    CKA_VERIFY_RECOVER,
    CKA_WRAP,
    CKA_TRUSTED,
    CKA_PUBLIC_KEY_INFO,
    CKA_MODULUS,
    CKA_MODULUS_BITS,
    CKA_PUBLIC_EXPONENT,
    CKA_EC_PARAMS,
    CKA_EC_POINT,
];

const PRIVATE_KEY: &[AttributeType] = &[
    CKA_SUBJECT,
    CKA_SENSITIVE,
    CKA_DECRYPT,
    CKA_SIGN,
    CKA_SIGN_RECOVER,
    CKA_UNWRAP,
    CKA_EXTRACTABLE,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_WRAP_WITH_TRUSTED,
    CKA_ALWAYS_AUTHENTICATE,
    CKA_PUBLIC_KEY_INFO,
    CKA_MODULUS,
    CKA_PUBLIC_EXPONENT,
    CKA_PRIVATE_EXPONENT,
    CKA_PRIME_1,
    CKA_PRIME_2,
    CKA_EXPONENT_1,
    CKA_EXPONENT_2,
    CKA_COEFFICIENT,
    CKA_EC_PARAMS,
    CKA_VALUE,
];

/// Set by the token, never by the caller.
const READ_ONLY_ON_CREATE: &[AttributeType] = &[
    CKA_LOCAL,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_KEY_GEN_MECHANISM,
];

/// Fixed once the object exists.
const IMMUTABLE: &[AttributeType] = &[
    CKA_CLASS,
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_MODIFIABLE,
    CKA_KEY_TYPE,
    CKA_CERTIFICATE_TYPE,
    CKA_TRUSTED,
    CKA_CHECK_VALUE,
    CKA_VALUE_LEN,
    CKA_MODULUS,
    CKA_MODULUS_BITS,
    CKA_PUBLIC_EXPONENT,
    CKA_EC_PARAMS,
    CKA_EC_POINT,
    CKA_PUBLIC_KEY_INFO,
    CKA_PRIVATE_EXPONENT,
    CKA_PRIME_1,
    CKA_PRIME_2,
    CKA_EXPONENT_1,
    CKA_EXPONENT_2,
    CKA_COEFFICIENT,
    CKA_LOCAL,
    CKA_ALWAYS_SENSITIVE,
    CKA_NEVER_EXTRACTABLE,
    CKA_KEY_GEN_MECHANISM,
];

const COPY_ALLOWED: &[AttributeType] = &[
    CKA_TOKEN,
    CKA_PRIVATE,
    CKA_MODIFIABLE,
    CKA_LABEL,
    CKA_ID,
    CKA_SENSITIVE,
    CKA_EXTRACTABLE,
    CKA_DESTROYABLE,
];

fn class_allows(class: CK_OBJECT_CLASS, attribute: AttributeType) -> bool {
    let specific: &[&[AttributeType]] = match class {
        CKO_DATA => &[DATA],
        CKO_CERTIFICATE => &[CERTIFICATE],
        CKO_SECRET_KEY => &[KEY, SECRET_KEY],
        CKO_PUBLIC_KEY => &[KEY, PUBLIC_KEY],
        CKO_PRIVATE_KEY => &[KEY, PRIVATE_KEY],
        _ => &[],
    };
    COMMON.contains(&attribute) || specific.iter().any(|list| list.contains(&attribute))
}

fn check_template(class: CK_OBJECT_CLASS, template: &AttributeTemplate) -> TokenResult<()> {
    for (attribute, _) in template.entries() {
        if READ_ONLY_ON_CREATE.contains(attribute) {
            return Err(TokenError::AttributeReadOnly(*attribute));
        }
        if !class_allows(class, *attribute) {
            return Err(TokenError::AttributeTypeInvalid(*attribute));
        }
    }
    Ok(())
}

fn fill_defaults(attrs: &mut AttributeSet, class: CK_OBJECT_CLASS) {
    let bool_default = |attrs: &mut AttributeSet, id, value| {
        attrs.default_value(id, AttributeValue::Bool(value));
    };
    let bytes_default = |attrs: &mut AttributeSet, id| {
        attrs.default_value(id, AttributeValue::Bytes(Vec::new()));
    };
    let private_by_default = matches!(class, CKO_PRIVATE_KEY | CKO_SECRET_KEY);

    bool_default(attrs, CKA_TOKEN, false);
    bool_default(attrs, CKA_PRIVATE, private_by_default);
    bool_default(attrs, CKA_MODIFIABLE, true);
    bool_default(attrs, CKA_COPYABLE, true);
    bool_default(attrs, CKA_DESTROYABLE, true);
    bytes_default(attrs, CKA_LABEL);

    match class {
        CKO_DATA => {
            bytes_default(attrs, CKA_APPLICATION);
            bytes_default(attrs, CKA_OBJECT_ID);
            bytes_default(attrs, CKA_VALUE);
        }
        CKO_CERTIFICATE => {
            bool_default(attrs, CKA_TRUSTED, false);
            attrs.default_value(CKA_CERTIFICATE_CATEGORY, AttributeValue::Ulong(0));
            for id in [CKA_ID, CKA_ISSUER, CKA_SERIAL_NUMBER, CKA_START_DATE, CKA_END_DATE] {
                bytes_default(attrs, id);
            }
        }
        _ => {
            for id in [CKA_ID, CKA_START_DATE, CKA_END_DATE] {
                bytes_default(attrs, id);
            }
            bool_default(attrs, CKA_DERIVE, false);
            bool_default(attrs, CKA_LOCAL, false);
            attrs.default_value(
                CKA_KEY_GEN_MECHANISM,
                AttributeValue::Ulong(CK_UNAVAILABLE_INFORMATION),
            );
            attrs.default_value(CKA_ALLOWED_MECHANISMS, AttributeValue::Mechanisms(Vec::new()));
        }
    }

    match class {
        CKO_SECRET_KEY => {
            for id in [CKA_ENCRYPT, CKA_DECRYPT, CKA_SIGN, CKA_VERIFY, CKA_WRAP, CKA_UNWRAP] {
                bool_default(attrs, id, true);
            }
            bool_default(attrs, CKA_SENSITIVE, false);
            bool_default(attrs, CKA_EXTRACTABLE, true);
            bool_default(attrs, CKA_WRAP_WITH_TRUSTED, false);
            bool_default(attrs, CKA_TRUSTED, false);
        }
        CKO_PUBLIC_KEY => {
            for id in [CKA_ENCRYPT, CKA_VERIFY, CKA_VERIFY_RECOVER, CKA_WRAP] {
                bool_default(attrs, id, true);
            }
            bool_default(attrs, CKA_TRUSTED, false);
            bytes_default(attrs, CKA_SUBJECT);
        }
        CKO_PRIVATE_KEY => {
            for id in [CKA_DECRYPT, CKA_SIGN, CKA_SIGN_RECOVER, CKA_UNWRAP] {
                bool_default(attrs, id, true);
            }
            bool_default(attrs, CKA_SENSITIVE, false);
            bool_default(attrs, CKA_EXTRACTABLE, true);
            bool_default(attrs, CKA_ALWAYS_AUTHENTICATE, false);
            bool_default(attrs, CKA_WRAP_WITH_TRUSTED, false);
            bytes_default(attrs, CKA_SUBJECT);
        }
        _ => {}
    }
}

/// How a key came to exist. Drives LOCAL and the sensitivity history flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Created,
    Generated(CK_MECHANISM_TYPE),
    Derived,
    Unwrapped,
}

/// Attributes and material for an object about to be stored.
pub struct NewObject {
    pub attributes: AttributeSet,
    pub material: Option<KeyMaterial>,
}

impl NewObject {
    pub fn is_token(&self) -> bool {
        self.attributes.bool_or(CKA_TOKEN, false)
    }

    pub fn is_private(&self) -> bool {
        self.attributes.bool_or(CKA_PRIVATE, false)
    }
}

fn check_key_size(key_type: CK_KEY_TYPE, material: &KeyMaterial) -> TokenResult<()> {
    let size = material.key_size();
    let valid = match key_type {
        CKK_AES => matches!(size, 16 | 24 | 32),
        CKK_GENERIC_SECRET => (1..=512).contains(&size),
        CKK_RSA => (1024..=4096).contains(&size),
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(TokenError::AttributeValueInvalid(CKA_VALUE))
    }
}

fn check_value(key_type: CK_KEY_TYPE, material: &KeyMaterial) -> TokenResult<Option<Vec<u8>>> {
    match (key_type, material.secret()) {
        (CKK_AES, Some(value)) => {
            let cipher = AesKey::new(value)?;
            let mut block = [0u8; 16];
            cipher.encrypt_block(&mut block);
            Ok(Some(block[..3].to_vec()))
        }
        _ => Ok(None),
    }
}

/// Assemble a key object from its material and a caller template.
pub fn new_key(
    class: CK_OBJECT_CLASS,
    key_type: CK_KEY_TYPE,
    template: &AttributeTemplate,
    material: KeyMaterial,
    origin: Origin,
) -> TokenResult<NewObject> {
    if template.ulong(CKA_CLASS).is_some_and(|value| value != class) {
        return Err(TokenError::TemplateInconsistent);
    }
    if template.ulong(CKA_KEY_TYPE).is_some_and(|value| value != key_type) {
        return Err(TokenError::TemplateInconsistent);
    }
    check_template(class, template)?;
    if origin != Origin::Created
        && material
            .sensitive_attributes()
            .iter()
            .any(|(id, _)| template.contains(*id))
    {
        return Err(TokenError::TemplateInconsistent);
    }
    check_key_size(key_type, &material)?;

    let mut attrs = AttributeSet::new();
    attrs.apply(template);
    for (id, _) in material.sensitive_attributes() {
        attrs.remove(id);
    }
    attrs.insert(CKA_CLASS, AttributeValue::Ulong(class));
    attrs.insert(CKA_KEY_TYPE, AttributeValue::Ulong(key_type));
    for (id, value) in material.public_attributes() {
        attrs.insert(id, value);
    }
    if let Some(kcv) = check_value(key_type, &material)? {
        attrs.insert(CKA_CHECK_VALUE, AttributeValue::Bytes(kcv));
    }
    fill_defaults(&mut attrs, class);

    if class != CKO_PUBLIC_KEY {
        let sensitive = attrs.bool_or(CKA_SENSITIVE, false);
        let extractable = attrs.bool_or(CKA_EXTRACTABLE, true);
        let (always_sensitive, never_extractable) = match origin {
            Origin::Generated(_) | Origin::Derived => (sensitive, !extractable),
            Origin::Created | Origin::Unwrapped => (false, false),
        };
        attrs.insert(CKA_ALWAYS_SENSITIVE, AttributeValue::Bool(always_sensitive));
        attrs.insert(CKA_NEVER_EXTRACTABLE, AttributeValue::Bool(never_extractable));
    }
    let local = matches!(origin, Origin::Generated(_));
    attrs.insert(CKA_LOCAL, AttributeValue::Bool(local));
    if let Origin::Generated(mechanism) = origin {
        attrs.insert(CKA_KEY_GEN_MECHANISM, AttributeValue::Ulong(mechanism));
    }

    Ok(NewObject {
        attributes: attrs,
        material: Some(material),
    })
}

/// Build an object from a `C_CreateObject` template.
pub fn from_template(template: &AttributeTemplate) -> TokenResult<NewObject> {
    let class = template
        .ulong(CKA_CLASS)
        .ok_or(TokenError::TemplateIncomplete)?;
    match class {
        CKO_DATA => {
            check_template(class, template)?;
            let mut attrs = AttributeSet::new();
            attrs.apply(template);
            fill_defaults(&mut attrs, class);
            Ok(NewObject {
                attributes: attrs,
                material: None,
            })
        }
        CKO_CERTIFICATE => {
            check_template(class, template)?;
            match template.ulong(CKA_CERTIFICATE_TYPE) {
                Some(CKC_X_509) => {}
                Some(_) => return Err(TokenError::AttributeValueInvalid(CKA_CERTIFICATE_TYPE)),
                None => return Err(TokenError::TemplateIncomplete),
            }
            if !template.contains(CKA_SUBJECT) || !template.contains(CKA_VALUE) {
                return Err(TokenError::TemplateIncomplete);
            }
            let mut attrs = AttributeSet::new();
            attrs.apply(template);
            fill_defaults(&mut attrs, class);
            Ok(NewObject {
                attributes: attrs,
                material: None,
            })
        }
        CKO_SECRET_KEY | CKO_PUBLIC_KEY | CKO_PRIVATE_KEY => {
            check_template(class, template)?;
            let key_type = template
                .ulong(CKA_KEY_TYPE)
                .ok_or(TokenError::TemplateIncomplete)?;
            if class == CKO_SECRET_KEY && template.contains(CKA_VALUE_LEN) {
                return Err(TokenError::TemplateInconsistent);
            }
            if class == CKO_SECRET_KEY && !matches!(key_type, CKK_AES | CKK_GENERIC_SECRET) {
                return Err(TokenError::AttributeValueInvalid(CKA_KEY_TYPE));
            }
            let mut raw = AttributeSet::new();
            raw.apply(template);
            let material = KeyMaterial::from_attributes(class, key_type, &raw)?;
            new_key(class, key_type, template, material, Origin::Created)
        }
        _ => Err(TokenError::AttributeValueInvalid(CKA_CLASS)),
    }
}

fn check_one_way(
    current: &AttributeSet,
    attribute: AttributeType,
    value: &AttributeValue,
) -> TokenResult<()> {
    let requested = value
        .as_bool()
        .ok_or(TokenError::AttributeValueInvalid(attribute))?;
    let allowed = match attribute {
        CKA_SENSITIVE => requested || !current.bool_or(CKA_SENSITIVE, false),
        CKA_EXTRACTABLE => !requested || current.bool_or(CKA_EXTRACTABLE, true),
        CKA_COPYABLE => !requested || current.bool_or(CKA_COPYABLE, true),
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(TokenError::AttributeReadOnly(attribute))
    }
}

/// Validate a `C_SetAttributeValue` template against an object. Nothing is
/// applied unless every entry passes.
pub fn check_set(object: &Object, template: &AttributeTemplate) -> TokenResult<()> {
    if !object.attributes.bool_or(CKA_MODIFIABLE, true) {
        return Err(TokenError::ActionProhibited);
    }
    let class = object.class();
    for (attribute, value) in template.entries() {
        if !class_allows(class, *attribute) {
            return Err(TokenError::AttributeTypeInvalid(*attribute));
        }
        if IMMUTABLE.contains(attribute) || (object.is_key() && *attribute == CKA_VALUE) {
            return Err(TokenError::AttributeReadOnly(*attribute));
        }
        if class == CKO_CERTIFICATE
            && matches!(*attribute, CKA_VALUE | CKA_SUBJECT | CKA_ISSUER | CKA_SERIAL_NUMBER)
        {
            return Err(TokenError::AttributeReadOnly(*attribute));
        }
        if matches!(*attribute, CKA_SENSITIVE | CKA_EXTRACTABLE | CKA_COPYABLE) {
            check_one_way(&object.attributes, *attribute, value)?;
        }
    }
    Ok(())
}

/// Validate a `C_CopyObject` template against the source object.
pub fn check_copy(object: &Object, template: &AttributeTemplate) -> TokenResult<()> {
    if !object.attributes.bool_or(CKA_COPYABLE, true) {
        return Err(TokenError::ActionProhibited);
    }
    let class = object.class();
    for (attribute, value) in template.entries() {
        if !class_allows(class, *attribute) {
            return Err(TokenError::AttributeTypeInvalid(*attribute));
        }
        if !COPY_ALLOWED.contains(attribute) {
            return Err(TokenError::AttributeReadOnly(*attribute));
        }
        if matches!(*attribute, CKA_SENSITIVE | CKA_EXTRACTABLE) {
            check_one_way(&object.attributes, *attribute, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn aes_template() -> AttributeTemplate {
        AttributeTemplate::new()
            .with(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY))
            .with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES))
            .with(CKA_VALUE, AttributeValue::Bytes(vec![0x11; 16]))
            .with(CKA_SENSITIVE, AttributeValue::Bool(true))
    }

    fn object_from(new: NewObject) -> Object {
        Object {
            slot: 0,
            owner: Owner::Token,
            attributes: new.attributes,
            material: new.material.map(Arc::new),
            store_id: None,
        }
    }

    #[test]
    fn secret_key_defaults_and_sensitivity() {
        let object = object_from(from_template(&aes_template()).expect("create"));
        assert_eq!(object.lookup(CKA_VALUE), AttributeLookup::Sensitive);
        assert_eq!(
            object.lookup(CKA_VALUE_LEN),
            AttributeLookup::Value(AttributeValue::Ulong(16).encode())
        );
        assert_eq!(
            object.lookup(CKA_ENCRYPT),
            AttributeLookup::Value(vec![1])
        );
        assert_eq!(object.lookup(CKA_MODULUS), AttributeLookup::Invalid);
        assert!(object.is_private());
        assert!(!object.attributes.bool_or(CKA_LOCAL, true));
        assert_eq!(object.attributes.bytes(CKA_CHECK_VALUE).map(<[u8]>::len), Some(3));
    }

    #[test]
    fn read_only_attributes_are_refused_on_create() {
        let template = aes_template().with(CKA_LOCAL, AttributeValue::Bool(true));
        assert!(matches!(
            from_template(&template),
            Err(TokenError::AttributeReadOnly(CKA_LOCAL))
        ));
        let missing_class = AttributeTemplate::new().with(CKA_LABEL, AttributeValue::Bytes(vec![]));
        assert!(matches!(
            from_template(&missing_class),
            Err(TokenError::TemplateIncomplete)
        ));
    }

    #[test]
    fn aes_key_length_is_checked() {
        let template = aes_template().with(CKA_VALUE, AttributeValue::Bytes(vec![0; 15]));
        assert!(matches!(
            from_template(&template),
            Err(TokenError::AttributeValueInvalid(CKA_VALUE))
        ));
    }

    #[test]
    fn sensitivity_only_moves_one_way() {
        let object = object_from(from_template(&aes_template()).expect("create"));
        let unset = AttributeTemplate::new().with(CKA_SENSITIVE, AttributeValue::Bool(false));
        assert_eq!(
            check_set(&object, &unset),
            Err(TokenError::AttributeReadOnly(CKA_SENSITIVE))
        );
        let relabel = AttributeTemplate::new().with(CKA_LABEL, AttributeValue::Bytes(b"k".to_vec()));
        assert_eq!(check_set(&object, &relabel), Ok(()));
        let retype = AttributeTemplate::new().with(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_RSA));
        assert_eq!(
            check_set(&object, &retype),
            Err(TokenError::AttributeReadOnly(CKA_KEY_TYPE))
        );
    }

    #[test]
    fn copy_template_is_restricted() {
        let object = object_from(from_template(&aes_template()).expect("create"));
        let ok = AttributeTemplate::new()
            .with(CKA_TOKEN, AttributeValue::Bool(false))
            .with(CKA_LABEL, AttributeValue::Bytes(b"copy".to_vec()));
        assert_eq!(check_copy(&object, &ok), Ok(()));
        let bad = AttributeTemplate::new().with(CKA_ENCRYPT, AttributeValue::Bool(false));
        assert_eq!(
            check_copy(&object, &bad),
            Err(TokenError::AttributeReadOnly(CKA_ENCRYPT))
        );
    }

    #[test]
    fn generated_keys_record_history() {
        let material = KeyMaterial::Secret(Zeroizing::new(vec![3; 32]));
        let template = AttributeTemplate::new().with(CKA_EXTRACTABLE, AttributeValue::Bool(false));
        let new = new_key(
            CKO_SECRET_KEY,
            CKK_AES,
            &template,
            material,
            Origin::Generated(CKM_AES_KEY_GEN),
        )
        .expect("key");
        assert!(new.attributes.bool_or(CKA_LOCAL, false));
        assert!(new.attributes.bool_or(CKA_NEVER_EXTRACTABLE, false));
        assert_eq!(new.attributes.ulong(CKA_KEY_GEN_MECHANISM), Some(CKM_AES_KEY_GEN));
    }
}
