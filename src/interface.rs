//! Interface and object tables.
//!
//! Interfaces are declared in the compact member-string form:
//!
//! ```text
//! $org.example.Lock          first entry is the name, '$' marks it secure
//! ?Open code<u ok>b          method with input and output arguments
//! !Opened by>s               signal
//! @State>y  @Code<u  @Name=s read, write and read-write properties
//! ```
//!
//! Every object implicitly carries `org.freedesktop.DBus.Properties` as
//! interface 0, so property accessors share one id layout across objects.

use crate::error::{BusError, BusResult};
use crate::value::ScriptValue;
use crate::wire::{self, encode_id, signature, MessageId, APP_LIST, PROPERTIES_IFACE, PROXY_LIST};
use serde::{Deserialize, Serialize};

/// Member type codes used by script interface definitions
pub mod member_type {
    /// Method
    pub const METHOD: f64 = 0.0;
    /// Signal
    pub const SIGNAL: f64 = 1.0;
    /// Property
    pub const PROPERTY: f64 = 2.0;
}

/// Property access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropAccess {
    /// Read-only
    Read,
    /// Write-only
    Write,
    /// Read-write
    ReadWrite,
}

impl PropAccess {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '>' => Some(Self::Read),
            '<' => Some(Self::Write),
            '=' => Some(Self::ReadWrite),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::Read => '>',
            Self::Write => '<',
            Self::ReadWrite => '=',
        }
    }

    /// Whether the property can be read
    pub fn readable(self) -> bool {
        !matches!(self, Self::Write)
    }

    /// Whether the property can be written
    pub fn writable(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Parse the script form: any combination of `R` and `W`
    pub fn parse_script(access: &str) -> BusResult<Self> {
        let (mut r, mut w) = (false, false);
        for c in access.chars() {
            match c {
                'R' | 'r' => r = true,
                'W' | 'w' => w = true,
                _ => {
                    return Err(BusError::invalid(
                        "access must be 'R', 'W', or 'RW'".to_string(),
                    ))
                }
            }
        }
        Ok(match (r, w) {
            (true, false) => Self::Read,
            (false, true) => Self::Write,
            _ => Self::ReadWrite,
        })
    }
}

/// Kind of interface member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Method
    Method,
    /// Signal
    Signal,
    /// Property with its access
    Property(PropAccess),
}

/// Interface member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member name
    pub name: String,
    /// Member kind
    pub kind: MemberKind,
    /// Input signature for methods, empty otherwise
    pub in_sig: String,
    /// Output signature for methods, argument signature for signals and
    /// value signature for properties
    pub out_sig: String,
}

impl Member {
    /// Parse one member string
    pub fn parse(entry: &str) -> BusResult<Self> {
        let mut chars = entry.chars();
        let prefix = chars
            .next()
            .ok_or_else(|| BusError::invalid("empty member"))?;
        let rest = chars.as_str();
        match prefix {
            '@' => {
                let split = rest
                    .find(['>', '<', '='])
                    .ok_or_else(|| BusError::invalid(format!("property '{}' has no access", rest)))?;
                let access = rest[split..]
                    .chars()
                    .next()
                    .and_then(PropAccess::from_char)
                    .ok_or_else(|| BusError::invalid("bad property access"))?;
                let sig = rest[split + 1..].trim();
                if !signature::is_single_complete_type(sig) {
                    return Err(BusError::signature(format!(
                        "property '{}' must have a single complete type",
                        &rest[..split]
                    )));
                }
                signature::validate(sig)?;
                Ok(Self {
                    name: rest[..split].to_string(),
                    kind: MemberKind::Property(access),
                    in_sig: String::new(),
                    out_sig: sig.to_string(),
                })
            }
            '?' | '!' => {
                let mut parts = rest.split_whitespace();
                let name = parts
                    .next()
                    .ok_or_else(|| BusError::invalid("member has no name"))?
                    .to_string();
                let mut in_sig = String::new();
                let mut out_sig = String::new();
                for arg in parts {
                    let split = arg
                        .find(['<', '>'])
                        .ok_or_else(|| BusError::invalid(format!("bad argument '{}'", arg)))?;
                    let sig = &arg[split + 1..];
                    if arg.as_bytes()[split] == b'<' {
                        in_sig.push_str(sig);
                    } else {
                        out_sig.push_str(sig);
                    }
                }
                signature::validate(&in_sig)?;
                signature::validate(&out_sig)?;
                let kind = if prefix == '?' {
                    MemberKind::Method
                } else {
                    if !in_sig.is_empty() {
                        return Err(BusError::invalid(format!(
                            "signal '{}' cannot have input arguments",
                            name
                        )));
                    }
                    MemberKind::Signal
                };
                Ok(Self {
                    name,
                    kind,
                    in_sig,
                    out_sig,
                })
            }
            other => Err(BusError::invalid(format!(
                "unknown member prefix '{}'",
                other
            ))),
        }
    }

    /// Signature of the message that invokes or emits this member
    pub fn call_signature(&self) -> &str {
        match self.kind {
            MemberKind::Method => &self.in_sig,
            MemberKind::Signal => &self.out_sig,
            MemberKind::Property(_) => "",
        }
    }

    /// Member string form
    pub fn to_entry(&self) -> String {
        match self.kind {
            MemberKind::Property(access) => {
                format!("@{}{}{}", self.name, access.as_char(), self.out_sig)
            }
            MemberKind::Method => {
                let mut s = format!("?{}", self.name);
                for ty in signature::split(&self.in_sig).unwrap_or_default() {
                    s.push_str(&format!(" <{}", ty));
                }
                for ty in signature::split(&self.out_sig).unwrap_or_default() {
                    s.push_str(&format!(" >{}", ty));
                }
                s
            }
            MemberKind::Signal => {
                let mut s = format!("!{}", self.name);
                for ty in signature::split(&self.out_sig).unwrap_or_default() {
                    s.push_str(&format!(" >{}", ty));
                }
                s
            }
        }
    }
}

/// Interface description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    /// Interface name
    pub name: String,
    /// Members require an encrypted channel
    pub secure: bool,
    /// Members in declaration order
    pub members: Vec<Member>,
}

impl InterfaceDescription {
    /// Parse the compact form, first entry being the interface name
    pub fn parse(entries: &[&str]) -> BusResult<Self> {
        let (head, members) = entries
            .split_first()
            .ok_or_else(|| BusError::invalid("interface description is empty"))?;
        let (name, secure) = match head.strip_prefix('$') {
            Some(name) => (name, true),
            None => (*head, false),
        };
        if name.is_empty() {
            return Err(BusError::invalid("interface has no name"));
        }
        let members = members
            .iter()
            .map(|m| Member::parse(m))
            .collect::<BusResult<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            secure,
            members,
        })
    }

    /// Build from a script interface definition object
    ///
    /// Each own property is a member: `{type, args, returns}` for methods
    /// and signals, `{type, signature, access}` for properties. Arguments are
    /// signature strings or single-key `{name: signature}` objects.
    pub fn from_script(name: &str, definition: &ScriptValue) -> BusResult<Self> {
        let obj = definition
            .as_object()
            .ok_or_else(|| BusError::invalid(format!("interface '{}' must be an object", name)))?;
        let mut entries = vec![name.to_string()];
        for (member, def) in obj.iter() {
            if def.as_object().is_none() {
                continue;
            }
            let ty = def.get("type").to_number();
            let entry = if ty == member_type::PROPERTY {
                let sig = def.get("signature").as_str().ok_or_else(|| {
                    BusError::invalid(format!("property '{}' requires a signature", member))
                })?;
                let access = match def.get("access").as_str() {
                    Some(a) => PropAccess::parse_script(a)?,
                    None => PropAccess::ReadWrite,
                };
                format!("@{}{}{}", member, access.as_char(), sig)
            } else if ty == member_type::METHOD || ty == member_type::SIGNAL {
                let is_method = ty == member_type::METHOD;
                let mut s = format!("{}{}", if is_method { '?' } else { '!' }, member);
                append_args(&mut s, def.get("args"), if is_method { '<' } else { '>' })?;
                if is_method {
                    append_args(&mut s, def.get("returns"), '>')?;
                }
                s
            } else {
                return Err(BusError::invalid(format!(
                    "member '{}' type must be METHOD, SIGNAL, or PROPERTY",
                    member
                )));
            };
            entries.push(entry);
        }
        let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
        Self::parse(&refs)
    }

    /// The standard properties interface
    pub fn properties() -> Self {
        Self {
            name: PROPERTIES_IFACE.to_string(),
            secure: false,
            members: vec![
                Member {
                    name: "Get".into(),
                    kind: MemberKind::Method,
                    in_sig: "ss".into(),
                    out_sig: "v".into(),
                },
                Member {
                    name: "Set".into(),
                    kind: MemberKind::Method,
                    in_sig: "ssv".into(),
                    out_sig: String::new(),
                },
                Member {
                    name: "GetAll".into(),
                    kind: MemberKind::Method,
                    in_sig: "s".into(),
                    out_sig: "a{sv}".into(),
                },
            ],
        }
    }

    /// Find a member by name
    pub fn member(&self, name: &str) -> Option<(usize, &Member)> {
        self.members.iter().enumerate().find(|(_, m)| m.name == name)
    }

    /// Properties in declaration order
    pub fn properties_iter(&self) -> impl Iterator<Item = (&Member, PropAccess)> {
        self.members.iter().filter_map(|m| match m.kind {
            MemberKind::Property(access) => Some((m, access)),
            _ => None,
        })
    }
}

fn append_args(out: &mut String, args: &ScriptValue, dir: char) -> BusResult<()> {
    if args.is_undefined() {
        return Ok(());
    }
    let list = args
        .as_array()
        .ok_or_else(|| BusError::invalid("argument list must be an array"))?;
    for arg in list {
        let (name, sig) = match arg {
            ScriptValue::String(sig) => (String::new(), sig.clone()),
            ScriptValue::Object(obj) => {
                let (name, sig) = obj
                    .iter()
                    .next()
                    .ok_or_else(|| BusError::invalid("named argument is empty"))?;
                let sig = sig
                    .as_str()
                    .ok_or_else(|| BusError::invalid("argument signature must be a string"))?;
                (name.clone(), sig.to_string())
            }
            _ => return Err(BusError::invalid("argument must be a signature")),
        };
        out.push_str(&format!(" {}{}{}", name, dir, sig));
    }
    Ok(())
}

/// Result of a property lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Value signature
    pub signature: String,
    /// Access
    pub access: PropAccess,
    /// Interface requires encryption
    pub secure: bool,
}

/// Object implemented by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalObject {
    /// Object path
    pub path: String,
    /// Indices into the interface table; index 0 is always the properties
    /// interface
    pub interfaces: Vec<usize>,
}

/// A message id resolved against the tables
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    /// Object path for application objects, `None` for proxies
    pub path: Option<&'a str>,
    /// Interface
    pub iface: &'a InterfaceDescription,
    /// Member
    pub member: &'a Member,
    /// Whether the id is a reply id
    pub is_reply: bool,
}

impl<'a> Resolved<'a> {
    /// Signature of the message carrying this id
    pub fn signature(&self) -> &'a str {
        if self.is_reply {
            &self.member.out_sig
        } else {
            self.member.call_signature()
        }
    }
}

/// Interface and object tables
#[derive(Debug, Clone)]
pub struct ObjectTable {
    interfaces: Vec<InterfaceDescription>,
    objects: Vec<LocalObject>,
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    /// Create tables holding only the properties interface
    pub fn new() -> Self {
        Self {
            interfaces: vec![InterfaceDescription::properties()],
            objects: Vec::new(),
        }
    }

    /// Build tables from script `interfaceDefinition` and `objectDefinition`
    /// objects
    pub fn from_script(
        interface_definition: &ScriptValue,
        object_definition: &ScriptValue,
    ) -> BusResult<Self> {
        let mut table = Self::new();
        if let Some(defs) = interface_definition.as_object() {
            for (name, def) in defs.iter() {
                table.add_interface(InterfaceDescription::from_script(name, def)?)?;
            }
        }
        if let Some(objs) = object_definition.as_object() {
            for (path, def) in objs.iter() {
                let Some(list) = def.get("interfaces").as_array() else {
                    tracing::error!(path = %path, "Object definition requires an array of interfaces");
                    continue;
                };
                let names: Vec<&str> = list.iter().filter_map(ScriptValue::as_str).collect();
                table.add_object(path, &names)?;
            }
        }
        Ok(table)
    }

    /// Register an interface, replacing one with the same name
    pub fn add_interface(&mut self, desc: InterfaceDescription) -> BusResult<()> {
        if desc.name == PROPERTIES_IFACE {
            return Err(BusError::invalid("the properties interface is built in"));
        }
        match self.interfaces.iter_mut().find(|i| i.name == desc.name) {
            Some(existing) => *existing = desc,
            None => {
                if self.interfaces.len() > u8::MAX as usize {
                    return Err(BusError::Resources);
                }
                self.interfaces.push(desc);
            }
        }
        Ok(())
    }

    /// Register an application object implementing the named interfaces
    pub fn add_object(&mut self, path: &str, interfaces: &[&str]) -> BusResult<()> {
        if !path.starts_with('/') {
            return Err(BusError::invalid(format!("invalid object path '{}'", path)));
        }
        let mut indices = vec![0];
        for name in interfaces {
            let idx = self
                .interface_index(name)
                .ok_or_else(|| BusError::invalid(format!("unknown interface '{}'", name)))?;
            indices.push(idx);
        }
        match self.objects.iter_mut().find(|o| o.path == path) {
            Some(obj) => obj.interfaces = indices,
            None => {
                if self.objects.len() > u8::MAX as usize {
                    return Err(BusError::Resources);
                }
                self.objects.push(LocalObject {
                    path: path.to_string(),
                    interfaces: indices,
                });
            }
        }
        Ok(())
    }

    fn interface_index(&self, name: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| i.name == name)
    }

    /// Look up an interface by name
    pub fn interface(&self, name: &str) -> Option<&InterfaceDescription> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// All interfaces, the properties interface first
    pub fn interfaces(&self) -> &[InterfaceDescription] {
        &self.interfaces
    }

    /// Application objects
    pub fn objects(&self) -> &[LocalObject] {
        &self.objects
    }

    /// Message id of a member of an application object
    pub fn local_message_id(&self, path: &str, iface: &str, member: &str) -> Option<u32> {
        let (obj_idx, obj) = self
            .objects
            .iter()
            .enumerate()
            .find(|(_, o)| o.path == path)?;
        let (iface_pos, &table_idx) = obj
            .interfaces
            .iter()
            .enumerate()
            .find(|(_, &i)| self.interfaces[i].name == iface)?;
        let (member_idx, _) = self.interfaces[table_idx].member(member)?;
        Some(encode_id(
            APP_LIST,
            obj_idx as u8,
            iface_pos as u8,
            member_idx as u8,
        ))
    }

    /// Message id of a member called on or emitted from a remote object
    pub fn proxy_message_id(&self, iface: &str, member: &str) -> Option<u32> {
        let iface_idx = self.interface_index(iface)?;
        let (member_idx, _) = self.interfaces[iface_idx].member(member)?;
        Some(encode_id(PROXY_LIST, 0, iface_idx as u8, member_idx as u8))
    }

    /// Resolve a message id
    pub fn resolve(&self, msg_id: u32) -> Option<Resolved<'_>> {
        let id = MessageId::decode(msg_id);
        let (path, iface) = match id.list {
            APP_LIST => {
                let obj = self.objects.get(id.obj as usize)?;
                let table_idx = *obj.interfaces.get(id.iface as usize)?;
                (Some(obj.path.as_str()), &self.interfaces[table_idx])
            }
            PROXY_LIST => (None, self.interfaces.get(id.iface as usize)?),
            _ => return None,
        };
        let member = iface.members.get(id.member as usize)?;
        Some(Resolved {
            path,
            iface,
            member,
            is_reply: id.is_reply,
        })
    }

    /// Body signature for a message id
    pub fn signature(&self, msg_id: u32) -> BusResult<&str> {
        self.resolve(msg_id)
            .map(|r| r.signature())
            .ok_or(BusError::NoMatch)
    }

    /// Whether the interface of a message id requires encryption
    pub fn is_secure(&self, msg_id: u32) -> bool {
        self.resolve(msg_id).map(|r| r.iface.secure).unwrap_or(false)
    }

    /// Property accessor index when `msg_id` is a properties-interface call
    pub fn accessor(&self, msg_id: u32) -> Option<u8> {
        let id = MessageId::decode(msg_id);
        let is_props = match id.list {
            APP_LIST | PROXY_LIST => id.iface == 0,
            _ => false,
        };
        if is_props && !id.is_reply {
            Some(id.member)
        } else {
            None
        }
    }

    /// Find a property's signature, access and security
    pub fn identify_property(&self, iface: &str, prop: &str) -> BusResult<PropertyInfo> {
        let desc = self.interface(iface).ok_or(BusError::NoMatch)?;
        let (_, member) = desc.member(prop).ok_or(BusError::NoMatch)?;
        match member.kind {
            MemberKind::Property(access) => Ok(PropertyInfo {
                signature: member.out_sig.clone(),
                access,
                secure: desc.secure,
            }),
            _ => Err(BusError::NoMatch),
        }
    }

    /// Find the first interface among `candidates` declaring `member`
    pub fn find_interface_for_member<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a str>,
        member: &str,
    ) -> Option<&InterfaceDescription> {
        candidates
            .into_iter()
            .filter_map(|name| self.interface(name))
            .find(|desc| desc.member(member).is_some())
    }
}

/// Whether a message id addresses the properties interface of an object
pub fn is_properties_id(msg_id: u32) -> bool {
    let id = MessageId::decode(msg_id);
    matches!(id.list, wire::APP_LIST | wire::PROXY_LIST) && id.iface == 0
}
