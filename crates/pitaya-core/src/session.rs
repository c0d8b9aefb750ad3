//! Per-request session context and the RPC client it talks through.
//!
//! A `Session` is built fresh for every `sys` request from the session bytes
//! the frontend forwarded. It is owned by that one dispatch; any change a
//! handler wants the frontend to see has to be sent back explicitly with
//! [`Session::push_to_frontend`] or [`Session::bind`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::RpcClientError;
use crate::protos::{KickAnswer, KickMsg, Push, SessionData};
use crate::route::Route;

/// Method a backend calls on the frontend's `sys` service to bind a session
/// to a uid.
pub const SESSION_BIND_METHOD: &str = "bindsession";
/// Method a backend calls on the frontend's `sys` service to replace its
/// session data.
pub const SESSION_PUSH_METHOD: &str = "pushsession";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound calls to other servers in the cluster.
///
/// The transport runtime provides the real implementation; the dispatcher
/// only hands it to sessions.
pub trait RpcClient: Send + Sync {
    /// Push a message to a user connected on `frontend_id`.
    fn send_push<'a>(
        &'a self,
        frontend_id: &'a str,
        push: Push,
    ) -> BoxFuture<'a, Result<(), RpcClientError>>;

    /// Ask `frontend_id` to disconnect a user.
    fn send_kick<'a>(
        &'a self,
        frontend_id: &'a str,
        kick: KickMsg,
    ) -> BoxFuture<'a, Result<KickAnswer, RpcClientError>>;

    /// Call `route` on the server identified by `server_id`.
    fn send_rpc<'a>(
        &'a self,
        server_id: &'a str,
        route: &'a Route,
        data: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>, RpcClientError>>;
}

/// RPC client that only logs what would have been sent.
#[derive(Debug, Default, Clone)]
pub struct LoggingRpcClient;

impl RpcClient for LoggingRpcClient {
    fn send_push<'a>(
        &'a self,
        frontend_id: &'a str,
        push: Push,
    ) -> BoxFuture<'a, Result<(), RpcClientError>> {
        Box::pin(async move {
            tracing::info!(
                "[RpcClient] push {} to uid {} via {} ({} bytes)",
                push.route,
                push.uid,
                frontend_id,
                push.data.len()
            );
            Ok(())
        })
    }

    fn send_kick<'a>(
        &'a self,
        frontend_id: &'a str,
        kick: KickMsg,
    ) -> BoxFuture<'a, Result<KickAnswer, RpcClientError>> {
        Box::pin(async move {
            tracing::info!("[RpcClient] kick uid {} via {}", kick.user_id, frontend_id);
            Ok(KickAnswer { kicked: true })
        })
    }

    fn send_rpc<'a>(
        &'a self,
        server_id: &'a str,
        route: &'a Route,
        data: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>, RpcClientError>> {
        Box::pin(async move {
            tracing::info!(
                "[RpcClient] rpc {} on {} ({} bytes)",
                route,
                server_id,
                data.len()
            );
            Ok(Vec::new())
        })
    }
}

/// Session of the user that originated a `sys` request.
pub struct Session {
    data: SessionData,
    frontend_id: String,
    rpc_client: Arc<dyn RpcClient>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.data.id)
            .field("uid", &self.data.uid)
            .field("frontend_id", &self.frontend_id)
            .finish()
    }
}

impl Session {
    pub fn new(
        data: SessionData,
        frontend_id: impl Into<String>,
        rpc_client: Arc<dyn RpcClient>,
    ) -> Self {
        Self {
            data,
            frontend_id: frontend_id.into(),
            rpc_client,
        }
    }

    /// Decode the session bytes forwarded with a request.
    pub fn decode(
        bytes: &[u8],
        frontend_id: impl Into<String>,
        rpc_client: Arc<dyn RpcClient>,
    ) -> Result<Self, serde_json::Error> {
        let data = SessionData::decode(bytes)?;
        Ok(Self::new(data, frontend_id, rpc_client))
    }

    pub fn id(&self) -> i64 {
        self.data.id
    }

    /// Bound user id; empty while the session is anonymous.
    pub fn uid(&self) -> &str {
        &self.data.uid
    }

    pub fn frontend_id(&self) -> &str {
        &self.frontend_id
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.data.get(key)
    }

    /// Set a session value locally. Call [`Session::push_to_frontend`] to
    /// make the frontend keep it.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.data.insert(key.into(), value);
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    /// Bind this session to `uid` and tell the frontend about it.
    pub async fn bind(&mut self, uid: impl Into<String>) -> Result<(), RpcClientError> {
        if !self.data.uid.is_empty() {
            return Err(RpcClientError::AlreadyBound(self.data.uid.clone()));
        }
        self.data.uid = uid.into();
        let payload = self.data.encode()?;
        let route = Route::new("", "sys", SESSION_BIND_METHOD);
        if let Err(e) = self
            .rpc_client
            .send_rpc(&self.frontend_id, &route, payload)
            .await
        {
            self.data.uid.clear();
            return Err(e);
        }
        Ok(())
    }

    /// Send the current session data to the frontend that owns the session.
    pub async fn push_to_frontend(&self) -> Result<(), RpcClientError> {
        let payload = self.data.encode()?;
        let route = Route::new("", "sys", SESSION_PUSH_METHOD);
        self.rpc_client
            .send_rpc(&self.frontend_id, &route, payload)
            .await?;
        Ok(())
    }

    /// Push a message to this session's user.
    pub async fn push(
        &self,
        route: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), RpcClientError> {
        if self.data.uid.is_empty() {
            return Err(RpcClientError::NotBound);
        }
        let push = Push {
            route: route.into(),
            uid: self.data.uid.clone(),
            data: data.into(),
        };
        self.rpc_client.send_push(&self.frontend_id, push).await
    }

    /// Disconnect this session's user.
    pub async fn kick(&self) -> Result<KickAnswer, RpcClientError> {
        if self.data.uid.is_empty() {
            return Err(RpcClientError::NotBound);
        }
        let kick = KickMsg {
            user_id: self.data.uid.clone(),
        };
        self.rpc_client.send_kick(&self.frontend_id, kick).await
    }
}
