//! Type descriptors from WIT definitions.
//!
//! [`TypeBuilder`] walks `wit_parser` types and produces the matching
//! [`TypeDesc`]. Descriptors are cached per type id so a resource used in
//! several places maps to one [`ResourceType`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use wit_parser::{Handle, Resolve, Type, TypeDefKind, TypeId, TypeOwner};

use crate::abi::TypeDesc;
use crate::abi::types::ResourceType;
use crate::error::Error;

/// A WIT type with no descriptor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WitTypeError {
    #[error("Unsupported WIT type: {0}")]
    Unsupported(String),

    #[error("Type '{0}' not found")]
    TypeNotFound(String),

    #[error("No named type found in WIT definition")]
    NoNamedType,

    #[error("Handle does not refer to a resource")]
    NotAResource,

    #[error("Invalid type '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Builds [`TypeDesc`]s for the types of one [`Resolve`].
pub struct TypeBuilder<'a> {
    resolve: &'a Resolve,
    cache: HashMap<TypeId, TypeDesc>,
}

impl<'a> TypeBuilder<'a> {
    pub fn new(resolve: &'a Resolve) -> Self {
        Self {
            resolve,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&self) -> &Resolve {
        self.resolve
    }

    /// Descriptor for any WIT type.
    pub fn build(&mut self, ty: &Type) -> Result<TypeDesc, WitTypeError> {
        Ok(match ty {
            Type::Bool => TypeDesc::BOOL,
            Type::U8 => TypeDesc::U8,
            Type::U16 => TypeDesc::U16,
            Type::U32 => TypeDesc::U32,
            Type::U64 => TypeDesc::U64,
            Type::S8 => TypeDesc::S8,
            Type::S16 => TypeDesc::S16,
            Type::S32 => TypeDesc::S32,
            Type::S64 => TypeDesc::S64,
            Type::F32 => TypeDesc::F32,
            Type::F64 => TypeDesc::F64,
            Type::Char => TypeDesc::CHAR,
            Type::String => TypeDesc::String,
            Type::Id(id) => self.build_id(*id)?,
            Type::ErrorContext => return Err(WitTypeError::Unsupported("error-context".to_string())),
        })
    }

    /// Descriptor for a named or anonymous type definition.
    pub fn build_id(&mut self, id: TypeId) -> Result<TypeDesc, WitTypeError> {
        if let Some(desc) = self.cache.get(&id) {
            return Ok(desc.clone());
        }
        let desc = self.build_def(id)?;
        self.cache.insert(id, desc.clone());
        Ok(desc)
    }

    fn build_def(&mut self, id: TypeId) -> Result<TypeDesc, WitTypeError> {
        let resolve = self.resolve;
        let def = resolve
            .types
            .get(id)
            .ok_or_else(|| WitTypeError::TypeNotFound(format!("{:?}", id)))?;
        let invalid = |reason: crate::abi::Trap| WitTypeError::Invalid {
            name: def.name.clone().unwrap_or_default(),
            reason: reason.to_string(),
        };
        match &def.kind {
            TypeDefKind::Type(t) => self.build(t),
            TypeDefKind::Record(r) => {
                let mut fields = Vec::with_capacity(r.fields.len());
                for field in &r.fields {
                    fields.push((field.name.clone(), self.build(&field.ty)?));
                }
                Ok(TypeDesc::record(fields))
            }
            TypeDefKind::Tuple(t) => Ok(TypeDesc::tuple(self.build_all(&t.types)?)),
            TypeDefKind::Flags(f) => Ok(TypeDesc::flags(f.flags.iter().map(|flag| flag.name.clone()))),
            TypeDefKind::Enum(e) => TypeDesc::enumeration(e.cases.iter().map(|case| case.name.clone())).map_err(invalid),
            TypeDefKind::Variant(v) => {
                let mut cases = Vec::with_capacity(v.cases.len());
                for case in &v.cases {
                    cases.push((case.name.clone(), self.build_optional(case.ty.as_ref())?));
                }
                TypeDesc::variant(cases).map_err(invalid)
            }
            TypeDefKind::Option(t) => Ok(TypeDesc::option(self.build(t)?)),
            TypeDefKind::Result(r) => Ok(TypeDesc::result(
                self.build_optional(r.ok.as_ref())?,
                self.build_optional(r.err.as_ref())?,
            )),
            TypeDefKind::List(t) => Ok(TypeDesc::list(self.build(t)?)),
            TypeDefKind::FixedSizeList(t, len) => {
                let element = self.build(t)?;
                let count = usize::try_from(*len).map_err(|_| WitTypeError::Unsupported(format!("list<_, {}>", len)))?;
                Ok(TypeDesc::tuple(vec![element; count]))
            }
            TypeDefKind::Resource => Ok(TypeDesc::Resource(self.resource_type(id)?)),
            TypeDefKind::Handle(Handle::Own(resource)) => Ok(TypeDesc::Own(self.resource_type(*resource)?)),
            TypeDefKind::Handle(Handle::Borrow(resource)) => Ok(TypeDesc::Borrow(self.resource_type(*resource)?)),
            TypeDefKind::Future(_) => Err(WitTypeError::Unsupported("future".to_string())),
            TypeDefKind::Stream(_) => Err(WitTypeError::Unsupported("stream".to_string())),
            TypeDefKind::Map(_, _) => Err(WitTypeError::Unsupported("map".to_string())),
            TypeDefKind::Unknown => Err(WitTypeError::Unsupported("unknown".to_string())),
        }
    }

    fn build_all(&mut self, types: &[Type]) -> Result<Vec<TypeDesc>, WitTypeError> {
        types.iter().map(|ty| self.build(ty)).collect()
    }

    fn build_optional(&mut self, ty: Option<&Type>) -> Result<Option<TypeDesc>, WitTypeError> {
        ty.map(|ty| self.build(ty)).transpose()
    }

    /// The resource behind `id`, following `use` aliases. Its id is
    /// `pkg:ns/iface/name`, matching [`InterfaceDesc::resource_id`](crate::bind::InterfaceDesc::resource_id).
    pub fn resource_type(&mut self, id: TypeId) -> Result<Arc<ResourceType>, WitTypeError> {
        let resolve = self.resolve;
        let mut current = id;
        loop {
            let def = resolve
                .types
                .get(current)
                .ok_or_else(|| WitTypeError::TypeNotFound(format!("{:?}", current)))?;
            match &def.kind {
                TypeDefKind::Type(Type::Id(next)) => current = *next,
                TypeDefKind::Resource => break,
                _ => return Err(WitTypeError::NotAResource),
            }
        }
        if let Some(TypeDesc::Resource(resource)) = self.cache.get(&current) {
            return Ok(resource.clone());
        }
        let def = resolve
            .types
            .get(current)
            .ok_or_else(|| WitTypeError::TypeNotFound(format!("{:?}", current)))?;
        let name = def.name.clone().ok_or(WitTypeError::NotAResource)?;
        let owner = match def.owner {
            TypeOwner::Interface(iface) => resolve.id_of(iface),
            TypeOwner::World(world) => resolve.worlds.get(world).map(|w| w.name.clone()),
            TypeOwner::None => None,
        };
        let id = match owner {
            Some(owner) => format!("{}/{}", owner, name),
            None => name.clone(),
        };
        let resource = Arc::new(ResourceType::new(name, id));
        self.cache.insert(current, TypeDesc::Resource(resource.clone()));
        Ok(resource)
    }
}

/// Find a type by name in a WIT Resolve.
/// Returns the TypeId if found, None otherwise.
pub fn find_type_by_name(resolve: &Resolve, name: &str) -> Option<TypeId> {
    resolve
        .types
        .iter()
        .find(|(_, ty)| ty.name.as_deref() == Some(name))
        .map(|(id, _)| id)
}

/// Find the first named type in a WIT Resolve.
pub fn find_first_named_type(resolve: &Resolve) -> Option<TypeId> {
    resolve
        .types
        .iter()
        .find(|(_, ty)| ty.name.is_some())
        .map(|(id, _)| id)
}

/// Load a WIT type definition from a string.
///
/// Returns the Resolve, TypeId, and descriptor for the specified type.
/// If `type_name` is None, uses the first named type in the definition.
///
/// # Example
///
/// ```ignore
/// use wit_bridge::wit::load_wit_type_from_string;
///
/// let wit_def = r#"
///     package test:types;
///     interface types {
///         record point { x: u32, y: u32 }
///     }
/// "#;
///
/// let (resolve, type_id, desc) = load_wit_type_from_string(wit_def, Some("point"))?;
/// assert_eq!(desc.size(), 8);
/// ```
pub fn load_wit_type_from_string(wit_definition: &str, type_name: Option<&str>) -> Result<(Resolve, TypeId, TypeDesc), Error> {
    let mut resolve = Resolve::new();
    resolve.push_str("input.wit", wit_definition)?;

    let type_id = match type_name {
        Some(name) => find_type_by_name(&resolve, name).ok_or_else(|| WitTypeError::TypeNotFound(name.to_string())),
        None => find_first_named_type(&resolve).ok_or(WitTypeError::NoNamedType),
    }?;

    let desc = TypeBuilder::new(&resolve).build_id(type_id)?;
    Ok((resolve, type_id, desc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::FlatType;

    const TYPES: &str = r#"
        package test:types;

        interface types {
            record point { x: u32, y: u32 }
            flags perms { read, write, exec }
            variant shape { circle(f32), square(u64), none }
            resource file;
            record opened { handle: own<file>, size: u64 }
        }
    "#;

    #[test]
    fn test_record_layout() {
        let (_, _, desc) = load_wit_type_from_string(TYPES, Some("point")).unwrap();
        assert_eq!(desc.size(), 8);
        assert_eq!(desc.alignment(), 4);
        assert_eq!(desc.flat_types(), &[FlatType::I32, FlatType::I32]);
    }

    #[test]
    fn test_variant_joins_payloads() {
        let (_, _, desc) = load_wit_type_from_string(TYPES, Some("shape")).unwrap();
        assert_eq!(desc.flat_types(), &[FlatType::I32, FlatType::I64]);
        assert_eq!(desc.size(), 16);
    }

    #[test]
    fn test_resource_ids_are_qualified() {
        let (resolve, id, _) = load_wit_type_from_string(TYPES, Some("opened")).unwrap();
        let file = find_type_by_name(&resolve, "file").unwrap();
        let mut builder = TypeBuilder::new(&resolve);
        let resource = builder.resource_type(file).unwrap();
        assert_eq!(resource.id(), "test:types/types/file");

        assert!(matches!(builder.build_id(id).unwrap(), TypeDesc::Record(_)));
        assert!(Arc::ptr_eq(&resource, &builder.resource_type(file).unwrap()));
    }

    #[test]
    fn test_missing_type() {
        let err = load_wit_type_from_string(TYPES, Some("nope")).unwrap_err();
        assert!(matches!(err, Error::WitType(WitTypeError::TypeNotFound(_))));
    }
}
