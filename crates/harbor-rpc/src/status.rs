//! `Status.*` endpoints. Always answered locally.

use crate::error::RpcResult;
use crate::server::RpcServer;

impl RpcServer {
    pub async fn status_ping(&self, _req: ()) -> RpcResult<()> {
        Ok(())
    }

    /// RPC address of the current leader, if one is known.
    pub async fn status_leader(&self, _req: ()) -> RpcResult<Option<String>> {
        Ok(self.consensus.leader().map(|l| l.addr))
    }

    /// RPC addresses of every voting server.
    pub async fn status_peers(&self, _req: ()) -> RpcResult<Vec<String>> {
        Ok(self.consensus.peers())
    }
}
