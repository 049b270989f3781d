//! Wire format for the remote proxy engine's inbound-handler RPC.
//!
//! These types mirror the shapes `tonic-build` would generate from the external engine's
//! `proxyman.command` proto (`AlterInboundRequest` / `AddUserOperation` / `RemoveUserOperation`).
//! They are hand-written here rather than generated, but the client stub below follows the
//! same shape `tonic-build` emits: a thin wrapper around a `tonic::client::Grpc<T>`.

use prost::Message;
use tonic::codegen::*;

use crate::account::Account;

/// `proxyman.command.User` — one account attached to an add operation.
#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(bytes = "vec", tag = "3")]
    pub account: Vec<u8>,
}

/// `proxyman.command.AddUserOperation`.
#[derive(Clone, PartialEq, Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

/// `proxyman.command.RemoveUserOperation`.
#[derive(Clone, PartialEq, Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

/// `proxyman.command.AlterInboundRequest`, with the operation flattened to a byte payload
/// carrying either an `AddUserOperation` or a `RemoveUserOperation`, as `tonic-build` emits
/// for a `google.protobuf.Any`-typed oneof field.
#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(string, tag = "2")]
    pub operation_type: String,
    #[prost(bytes = "vec", tag = "3")]
    pub operation: Vec<u8>,
}

impl AlterInboundRequest {
    pub fn add_user(tag: impl Into<String>, level: u32, account: &Account) -> Self {
        let op = AddUserOperation {
            user: Some(User { level, email: account_email(account), account: encode_account(account) }),
        };
        Self { tag: tag.into(), operation_type: "AddUserOperation".to_string(), operation: op.encode_to_vec() }
    }

    pub fn remove_user(tag: impl Into<String>, email: impl Into<String>) -> Self {
        let op = RemoveUserOperation { email: email.into() };
        Self { tag: tag.into(), operation_type: "RemoveUserOperation".to_string(), operation: op.encode_to_vec() }
    }
}

fn account_email(account: &Account) -> String {
    match account {
        Account::Vmess { email, .. }
        | Account::Vless { email, .. }
        | Account::Trojan { email, .. }
        | Account::Shadowsocks { email, .. } => email.clone(),
    }
}

/// Encodes the polymorphic account payload the external engine expects, keyed by proxy type
/// in its own `typed_message` envelope. The exact inner encoding is engine-defined; this
/// produces a stable, self-describing byte form sufficient for the engine's dispatch-by-type.
fn encode_account(account: &Account) -> Vec<u8> {
    #[derive(Clone, PartialEq, Message)]
    struct VmessAccountPb {
        #[prost(string, tag = "1")]
        id: String,
    }
    #[derive(Clone, PartialEq, Message)]
    struct VlessAccountPb {
        #[prost(string, tag = "1")]
        id: String,
        #[prost(string, optional, tag = "2")]
        flow: Option<String>,
    }
    #[derive(Clone, PartialEq, Message)]
    struct TrojanAccountPb {
        #[prost(string, tag = "1")]
        password: String,
        #[prost(string, optional, tag = "2")]
        flow: Option<String>,
    }
    #[derive(Clone, PartialEq, Message)]
    struct ShadowsocksAccountPb {
        #[prost(string, tag = "1")]
        password: String,
        #[prost(string, tag = "2")]
        method: String,
    }

    match account {
        Account::Vmess { id, .. } => VmessAccountPb { id: id.clone() }.encode_to_vec(),
        Account::Vless { id, flow, .. } => {
            VlessAccountPb { id: id.clone(), flow: flow.clone() }.encode_to_vec()
        }
        Account::Trojan { password, flow, .. } => {
            TrojanAccountPb { password: password.clone(), flow: flow.clone() }.encode_to_vec()
        }
        Account::Shadowsocks { password, method, .. } => {
            ShadowsocksAccountPb { password: password.clone(), method: method.clone() }.encode_to_vec()
        }
    }
}

/// `proxyman.command.AlterInboundResponse` — empty on success; failures surface as a gRPC
/// `Status` instead of a typed field.
#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundResponse {}

/// Client for the external engine's `HandlerService`, shaped the way `tonic-build` emits a
/// generated client: a thin wrapper around `tonic::client::Grpc<T>`.
#[derive(Debug, Clone)]
pub struct HandlerServiceClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> HandlerServiceClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = bytes::Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        let inner = tonic::client::Grpc::new(inner);
        Self { inner }
    }

    pub async fn alter_inbound(
        &mut self,
        request: AlterInboundRequest,
        call_timeout: std::time::Duration,
    ) -> Result<tonic::Response<AlterInboundResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("service was not ready: {}", e.into()))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(
            "/proxyman.command.HandlerService/AlterInbound",
        );
        let mut req = tonic::Request::new(request);
        req.set_timeout(call_timeout);
        self.inner.unary(req, path, codec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_user_request_round_trips_through_prost() {
        let account = Account::Vless {
            email: "1.bob".to_string(),
            id: "uuid".to_string(),
            level: 0,
            flow: Some("xtls-rprx-vision".to_string()),
        };
        let req = AlterInboundRequest::add_user("inbound-1", 0, &account);
        let bytes = req.encode_to_vec();
        let decoded = AlterInboundRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.tag, "inbound-1");
        assert_eq!(decoded.operation_type, "AddUserOperation");
    }

    #[test]
    fn remove_user_request_carries_email() {
        let req = AlterInboundRequest::remove_user("inbound-1", "1.bob");
        let op = RemoveUserOperation::decode(req.operation.as_slice()).unwrap();
        assert_eq!(op.email, "1.bob");
    }
}
