//! `Session.*` endpoints.

use harbor_raft::{Command, CommandResponse};
use harbor_state::{
    DcSpecificRequest, IndexedSessions, NodeSpecificRequest, SessionOp, SessionRequest,
    SessionSpecificRequest, Table,
};
use rand::Rng;
use tracing::debug;

use crate::error::{RpcError, RpcResult};
use crate::server::RpcServer;

/// Random 128-bit ID in the familiar 8-4-4-4-12 hex layout.
fn generate_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    let hex = |range: std::ops::Range<usize>| -> String {
        bytes[range].iter().map(|b| format!("{b:02x}")).collect()
    };
    format!(
        "{}-{}-{}-{}-{}",
        hex(0..4),
        hex(4..6),
        hex(6..8),
        hex(8..10),
        hex(10..16)
    )
}

impl RpcServer {
    /// Create or destroy a session. Returns the session ID; on create the
    /// ID is generated here, before the command reaches the log.
    pub async fn session_apply(&self, mut req: SessionRequest) -> RpcResult<String> {
        if let Some(id) = self.forward("Session.Apply", &req.datacenter, None, &req).await? {
            return Ok(id);
        }
        match req.op {
            SessionOp::Destroy => {
                if req.session.id.is_empty() {
                    return Err(RpcError::Validation("must provide session id".into()));
                }
            }
            SessionOp::Create => {
                if req.session.node.is_empty() {
                    return Err(RpcError::Validation("must provide node".into()));
                }
                req.session.id = loop {
                    let id = generate_id();
                    if self.store.session_get(&id)?.is_none() {
                        break id;
                    }
                };
            }
        }
        let id = req.session.id.clone();
        debug!(session = %id, op = ?req.op, "session apply");
        match self.raft_apply(Command::Session(req)).await? {
            CommandResponse::SessionId(created) => Ok(created),
            _ => Ok(id),
        }
    }

    pub async fn session_get(&self, req: SessionSpecificRequest) -> RpcResult<IndexedSessions> {
        if let Some(reply) = self
            .forward("Session.Get", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (sessions, meta) = self
            .blocking_query(&req.options, &[Table::Sessions], |snap| {
                Ok(snap.session_get(&req.session_id)?.into_iter().collect())
            })
            .await?;
        Ok(IndexedSessions { sessions, meta })
    }

    pub async fn session_list(&self, req: DcSpecificRequest) -> RpcResult<IndexedSessions> {
        if let Some(reply) = self
            .forward("Session.List", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (sessions, meta) = self
            .blocking_query(&req.options, &[Table::Sessions], |snap| snap.session_list())
            .await?;
        Ok(IndexedSessions { sessions, meta })
    }

    pub async fn session_node_sessions(
        &self,
        req: NodeSpecificRequest,
    ) -> RpcResult<IndexedSessions> {
        if let Some(reply) = self
            .forward("Session.NodeSessions", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (sessions, meta) = self
            .blocking_query(&req.options, &[Table::Sessions], |snap| {
                snap.node_sessions(&req.node)
            })
            .await?;
        Ok(IndexedSessions { sessions, meta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{register_node, test_server};
    use harbor_state::{DeregisterRequest, Session};
    use std::time::Duration;

    fn create(node: &str) -> SessionRequest {
        SessionRequest {
            datacenter: "dc1".into(),
            op: SessionOp::Create,
            session: Session {
                id: String::new(),
                node: node.into(),
                name: "lock-holder".into(),
                lock_delay: Duration::from_secs(15),
                create_index: 0,
            },
        }
    }

    #[test]
    fn ids_look_like_uuids() {
        let id = generate_id();
        let lens: Vec<_> = id.split('-').map(str::len).collect();
        assert_eq!(lens, vec![8, 4, 4, 4, 12]);
        assert_ne!(id, generate_id());
    }

    #[tokio::test]
    async fn create_get_list_destroy() {
        let server = test_server();
        register_node(&server, "foo", "127.0.0.1").await;

        let id = server.session_apply(create("foo")).await.unwrap();
        let got = server
            .session_get(SessionSpecificRequest {
                datacenter: "dc1".into(),
                session_id: id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(got.sessions.len(), 1);
        assert_eq!(got.sessions[0].node, "foo");

        let by_node = server
            .session_node_sessions(NodeSpecificRequest {
                datacenter: "dc1".into(),
                node: "foo".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_node.sessions.len(), 1);

        let mut destroy = create("foo");
        destroy.op = SessionOp::Destroy;
        destroy.session.id = id;
        server.session_apply(destroy).await.unwrap();
        let all = server.session_list(DcSpecificRequest::default()).await.unwrap();
        assert!(all.sessions.is_empty());
    }

    #[tokio::test]
    async fn session_needs_a_known_node() {
        let server = test_server();
        let err = server.session_apply(create("ghost")).await.unwrap_err();
        assert!(matches!(err, RpcError::Apply(_)));

        let err = server.session_apply(create("")).await.unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
    }

    #[tokio::test]
    async fn deleting_node_invalidates_sessions() {
        let server = test_server();
        register_node(&server, "foo", "127.0.0.1").await;
        server.session_apply(create("foo")).await.unwrap();
        server
            .catalog_deregister(DeregisterRequest {
                datacenter: "dc1".into(),
                node: "foo".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let all = server.session_list(DcSpecificRequest::default()).await.unwrap();
        assert!(all.sessions.is_empty());
    }
}
