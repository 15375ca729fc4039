//! Cluster wire message of the checkpoint protocol.
//!
//! A message travels as a flat field map so that any text-oriented cluster
//! transport can carry it; binary blobs are base64-encoded and enum values
//! are written by name.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use crate::server::RequestKind;
use crate::store::{
    CkptAttributes, CkptError, CkptResult, ClientHandle, NodeName, OpKind,
    OpNo, OpenFlags, RequestNo,
};
use crate::utils::CheckpointdError;

/// Message type tag of every checkpoint message.
pub const MSG_TYPE: &str = "ckpt";

/// Protocol version; messages carrying any other version are dropped.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A message in field-map form, as carried by the cluster transport.
pub type FieldMsg = BTreeMap<String, String>;

const F_TYPE: &str = "t";
const F_SUBTYPE: &str = "cksub";
const F_VERSION: &str = "ckver";
const F_FROM: &str = "src";
const F_NAME: &str = "ckname";
const F_ACTIVE: &str = "ckact";
const F_CLIENT_HOST: &str = "cname";
const F_CLIENT_HANDLE: &str = "chdl";
const F_CLIENT_REQUEST: &str = "ckreq";
const F_CLIENT_REQUEST_NO: &str = "creqno";
const F_OPERATION: &str = "ckop";
const F_OPERATION_NO: &str = "ckopno";
const F_PARAM: &str = "ckpar";
const F_DATA: &str = "ckdat";
const F_RET: &str = "ckrt";

/// Value of the return-code field on success.
const RET_OK: &str = "Ok";

/// Protocol message subtypes.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum Subtype {
    Created,
    CreatedReply,

    OpenBcast,
    OpenBcastReply,
    CkptCreateBcast,
    CkptCreateBcastReply,
    OpenRemote,
    OpenRemoteReply,
    CloseRemote,
    CloseRemoteReply,
    UnlinkBcast,

    ReplicaCreate,
    ReplicaCreateReply,
    ReplicaAdd,
    ReplicaAddReply,
    ReplicaAddPrepareBcast,
    ReplicaAddPrepareBcastReply,
    ReplicaAddCommitBcast,
    ReplicaAddCommitBcastReply,
    ReplicaAddRollbackBcast,
    ReplicaAddRollbackBcastReply,
    ReplicaDelBcast,

    Update,
    UpdateReply,
    UpdatePrepareBcast,
    UpdatePrepareBcastReply,
    UpdateCommitBcast,
    UpdateCommitBcastReply,
    UpdateRollbackBcast,
    UpdateRollbackBcastReply,
    UpdateBcast,

    Read,
    ReadReply,
    Sync,
    SyncReply,

    ActiveSetBcast,
    ActiveSetBcastReply,
    ActiveSet,
    ActiveSetReply,
    ActiveSetFinishBcast,
}

/// Answer of one node to an open broadcast.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum OpenVerdict {
    /// Replier holds the active replica.
    Active,
    /// Replier holds a standby replica; `active_node` names the active one.
    Standby,
    NoReplica,
    /// Replier is racing to create the same checkpoint and wins.
    RaceHigh,
    /// Replier is racing too but yields to the requester.
    RaceLow,
    /// Replier opened earlier against the holder named in `active_node`.
    Earlier,
}

/// Parameter of open broadcast, open remote, and replica create.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OpenParam {
    pub attrs: Option<CkptAttributes>,
    pub flags: OpenFlags,
}

/// One checkpoint protocol message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CkptMessage {
    pub subtype: Subtype,
    pub version: String,

    /// Sending node.
    pub from: NodeName,

    pub ckpt_name: String,

    /// Node hosting the client the message is on behalf of; for node-list
    /// changes, the node being added.
    pub client_host: NodeName,
    pub client_handle: ClientHandle,
    pub client_request: Option<RequestKind>,
    pub client_req_no: RequestNo,

    pub active_node: NodeName,

    pub operation: Option<OpKind>,
    pub op_no: OpNo,

    /// Subtype-specific parameter, msgpack-encoded.
    pub param: Vec<u8>,

    /// Bulk payload such as a packed replica.
    pub data: Vec<u8>,

    pub ret: CkptResult<()>,
}

impl CkptMessage {
    /// Creates an empty message of the given subtype.
    pub fn new(subtype: Subtype, from: &str, ckpt_name: &str) -> Self {
        CkptMessage {
            subtype,
            version: PROTOCOL_VERSION.into(),
            from: from.into(),
            ckpt_name: ckpt_name.into(),
            client_host: String::new(),
            client_handle: 0,
            client_request: None,
            client_req_no: 0,
            active_node: String::new(),
            operation: None,
            op_no: 0,
            param: vec![],
            data: vec![],
            ret: Ok(()),
        }
    }

    /// Derives a reply from `me`, keeping every correlation field.
    pub fn reply(&self, subtype: Subtype, me: &str) -> Self {
        CkptMessage {
            subtype,
            from: me.into(),
            version: PROTOCOL_VERSION.into(),
            param: vec![],
            data: vec![],
            ret: Ok(()),
            ..self.clone()
        }
    }

    pub fn with_client(
        mut self,
        host: &str,
        client: ClientHandle,
        req_no: RequestNo,
        kind: RequestKind,
    ) -> Self {
        self.client_host = host.into();
        self.client_handle = client;
        self.client_req_no = req_no;
        self.client_request = Some(kind);
        self
    }

    /// Sets the client correlation fields without naming the call kind.
    pub fn with_origin(
        mut self,
        host: &str,
        client: ClientHandle,
        req_no: RequestNo,
    ) -> Self {
        self.client_host = host.into();
        self.client_handle = client;
        self.client_req_no = req_no;
        self
    }

    pub fn with_op(mut self, kind: OpKind, op_no: OpNo) -> Self {
        self.operation = Some(kind);
        self.op_no = op_no;
        self
    }

    pub fn with_active(mut self, active_node: &str) -> Self {
        self.active_node = active_node.into();
        self
    }

    pub fn with_ret(mut self, ret: CkptResult<()>) -> Self {
        self.ret = ret;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Attaches a msgpack-encoded parameter.
    pub fn with_param<T: Serialize>(
        mut self,
        param: &T,
    ) -> Result<Self, CheckpointdError> {
        self.param = encode_to_vec(param)?;
        Ok(self)
    }

    /// Decodes the parameter blob.
    pub fn param_as<T: DeserializeOwned>(&self) -> Result<T, CheckpointdError> {
        Ok(decode_from_slice(&self.param)?)
    }

    /// Encodes the message into its field map.
    pub fn to_fields(&self) -> Result<FieldMsg, CheckpointdError> {
        let mut fields = FieldMsg::new();
        fields.insert(F_TYPE.into(), MSG_TYPE.into());
        fields.insert(F_SUBTYPE.into(), enum_to_field(&self.subtype)?);
        fields.insert(F_VERSION.into(), self.version.clone());
        fields.insert(F_FROM.into(), self.from.clone());
        fields.insert(F_NAME.into(), self.ckpt_name.clone());
        fields.insert(F_ACTIVE.into(), self.active_node.clone());
        fields.insert(F_CLIENT_HOST.into(), self.client_host.clone());
        fields.insert(F_CLIENT_HANDLE.into(), self.client_handle.to_string());
        if let Some(kind) = &self.client_request {
            fields.insert(F_CLIENT_REQUEST.into(), enum_to_field(kind)?);
        }
        fields.insert(
            F_CLIENT_REQUEST_NO.into(),
            self.client_req_no.to_string(),
        );
        if let Some(kind) = &self.operation {
            fields.insert(F_OPERATION.into(), enum_to_field(kind)?);
        }
        fields.insert(F_OPERATION_NO.into(), self.op_no.to_string());
        if !self.param.is_empty() {
            fields.insert(F_PARAM.into(), STANDARD.encode(&self.param));
        }
        if !self.data.is_empty() {
            fields.insert(F_DATA.into(), STANDARD.encode(&self.data));
        }
        let ret = match &self.ret {
            Ok(()) => RET_OK.into(),
            Err(e) => enum_to_field(e)?,
        };
        fields.insert(F_RET.into(), ret);
        Ok(fields)
    }

    /// Decodes a message from its field map.
    pub fn from_fields(fields: &FieldMsg) -> Result<Self, CheckpointdError> {
        let get = |key: &str| -> Result<&String, CheckpointdError> {
            fields.get(key).ok_or_else(|| {
                CheckpointdError::msg(format!("missing field '{}'", key))
            })
        };

        if get(F_TYPE)? != MSG_TYPE {
            return Err(CheckpointdError::msg(format!(
                "unexpected message type '{}'",
                get(F_TYPE)?
            )));
        }

        let ret = match get(F_RET)?.as_str() {
            RET_OK => Ok(()),
            code => Err(enum_from_field::<CkptError>(code)?),
        };
        Ok(CkptMessage {
            subtype: enum_from_field(get(F_SUBTYPE)?)?,
            version: get(F_VERSION)?.clone(),
            from: get(F_FROM)?.clone(),
            ckpt_name: get(F_NAME)?.clone(),
            client_host: get(F_CLIENT_HOST)?.clone(),
            client_handle: get(F_CLIENT_HANDLE)?.parse()?,
            client_request: fields
                .get(F_CLIENT_REQUEST)
                .map(|s| enum_from_field(s))
                .transpose()?,
            client_req_no: get(F_CLIENT_REQUEST_NO)?.parse()?,
            active_node: get(F_ACTIVE)?.clone(),
            operation: fields
                .get(F_OPERATION)
                .map(|s| enum_from_field(s))
                .transpose()?,
            op_no: get(F_OPERATION_NO)?.parse()?,
            param: match fields.get(F_PARAM) {
                Some(s) => STANDARD.decode(s)?,
                None => vec![],
            },
            data: match fields.get(F_DATA) {
                Some(s) => STANDARD.decode(s)?,
                None => vec![],
            },
            ret,
        })
    }
}

/// Writes a unit enum variant as its name. msgpack carries unit variants
/// as bare strings, so the name is read back out of the encoding.
fn enum_to_field<T: Serialize>(value: &T) -> Result<String, CheckpointdError> {
    decode_from_slice::<String>(&encode_to_vec(value)?).map_err(|_| {
        CheckpointdError::msg("only unit variants can be written as a field")
    })
}

/// Reads a unit enum variant from its name.
fn enum_from_field<T: DeserializeOwned>(
    field: &str,
) -> Result<T, CheckpointdError> {
    Ok(decode_from_slice(&encode_to_vec(field)?)?)
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use crate::store::{CreationFlags, TIME_END};

    fn sample() -> Result<CkptMessage, CheckpointdError> {
        CkptMessage::new(Subtype::OpenBcast, "alpha", "c1")
            .with_client("alpha", 3, 17, RequestKind::Open)
            .with_active("beta")
            .with_op(OpKind::Update, 0)
            .with_data(vec![0, 1, 2, 255])
            .with_param(&OpenParam {
                attrs: Some(CkptAttributes {
                    creation_flags: CreationFlags::WriteAllReplicas,
                    checkpoint_size: 10,
                    retention: TIME_END,
                    max_sections: 2,
                    max_section_size: 5,
                    max_section_id_size: 4,
                }),
                flags: OpenFlags::WRITE.with(OpenFlags::COLOCATED),
            })
    }

    #[test]
    fn fields_roundtrip() -> Result<(), CheckpointdError> {
        let msg = sample()?.with_ret(Err(CkptError::Exist));
        let fields = msg.to_fields()?;
        assert_eq!(fields[F_TYPE], MSG_TYPE);
        assert_eq!(fields[F_SUBTYPE], "OpenBcast");
        assert_eq!(fields[F_RET], "Exist");
        assert_eq!(fields[F_CLIENT_REQUEST], "Open");
        assert_eq!(fields[F_OPERATION], "Update");
        assert_eq!(CkptMessage::from_fields(&fields)?, msg);
        Ok(())
    }

    #[test]
    fn reply_keeps_correlation() -> Result<(), CheckpointdError> {
        let msg = sample()?;
        let reply = msg.reply(Subtype::OpenBcastReply, "gamma");
        assert_eq!(reply.from, "gamma");
        assert_eq!(reply.client_host, "alpha");
        assert_eq!(reply.client_req_no, 17);
        assert!(reply.param.is_empty() && reply.data.is_empty());
        let reply = reply.with_param(&OpenVerdict::RaceHigh)?;
        assert_eq!(reply.param_as::<OpenVerdict>()?, OpenVerdict::RaceHigh);
        Ok(())
    }

    #[test]
    fn reject_malformed() -> Result<(), CheckpointdError> {
        let mut fields = sample()?.to_fields()?;
        fields.insert(F_TYPE.into(), "status".into());
        assert!(CkptMessage::from_fields(&fields).is_err());
        let mut fields = sample()?.to_fields()?;
        fields.remove(F_OPERATION_NO);
        assert!(CkptMessage::from_fields(&fields).is_err());
        let mut fields = sample()?.to_fields()?;
        fields.insert(F_SUBTYPE.into(), "Bogus".into());
        assert!(CkptMessage::from_fields(&fields).is_err());
        let mut fields = sample()?.to_fields()?;
        fields.insert(F_DATA.into(), "!!not base64!!".into());
        assert!(CkptMessage::from_fields(&fields).is_err());
        Ok(())
    }

    #[test]
    fn field_names_of_unit_variants() -> Result<(), CheckpointdError> {
        assert_eq!(enum_to_field(&OpenVerdict::RaceLow)?, "RaceLow");
        assert_eq!(
            enum_from_field::<OpKind>("ActiveSet")?,
            OpKind::ActiveSet
        );
        assert!(enum_to_field(&17u32).is_err());
        assert!(enum_to_field(&OpenParam {
            attrs: None,
            flags: OpenFlags::READ,
        })
        .is_err());
        assert!(enum_from_field::<OpKind>("Open").is_err());
        Ok(())
    }
}
