//! `Coordinate.*` endpoints.

use harbor_raft::Command;
use harbor_state::{
    Coordinate, CoordinateEntry, CoordinateUpdateRequest, IndexedCoordinate, NodeSpecificRequest,
    Table,
};

use crate::error::{RpcError, RpcResult};
use crate::server::RpcServer;

fn valid(coord: &Coordinate) -> bool {
    !coord.vec.is_empty()
        && coord.vec.iter().all(|c| c.is_finite())
        && coord.error.is_finite()
        && coord.adjustment.is_finite()
        && coord.height.is_finite()
}

impl RpcServer {
    /// Record a node's network coordinate. Updates for nodes the catalog
    /// does not know are dropped by the state machine.
    pub async fn coordinate_update(&self, req: CoordinateUpdateRequest) -> RpcResult<()> {
        if let Some(done) = self
            .forward("Coordinate.Update", &req.datacenter, None, &req)
            .await?
        {
            return Ok(done);
        }
        if req.node.is_empty() {
            return Err(RpcError::Validation("must provide node".into()));
        }
        if !valid(&req.coord) {
            return Err(RpcError::Validation(format!(
                "invalid coordinate for node {:?}",
                req.node
            )));
        }
        self.raft_apply(Command::CoordinateBatchUpdate(vec![CoordinateEntry {
            node: req.node,
            coord: req.coord,
        }]))
        .await?;
        Ok(())
    }

    pub async fn coordinate_get(&self, req: NodeSpecificRequest) -> RpcResult<IndexedCoordinate> {
        if let Some(reply) = self
            .forward("Coordinate.Get", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (coord, meta) = self
            .blocking_query(&req.options, &[Table::Coordinates], |snap| {
                snap.coordinate_get(&req.node)
            })
            .await?;
        Ok(IndexedCoordinate { coord, meta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{register_node, test_server};

    fn update(node: &str, coord: Coordinate) -> CoordinateUpdateRequest {
        CoordinateUpdateRequest {
            datacenter: "dc1".into(),
            node: node.into(),
            coord,
        }
    }

    fn get(node: &str) -> NodeSpecificRequest {
        NodeSpecificRequest {
            datacenter: "dc1".into(),
            node: node.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_then_get() {
        let server = test_server();
        register_node(&server, "foo", "127.0.0.1").await;

        let mut coord = Coordinate::new(8);
        coord.vec[0] = 0.25;
        server.coordinate_update(update("foo", coord.clone())).await.unwrap();
        assert_eq!(server.coordinate_get(get("foo")).await.unwrap().coord, Some(coord));

        // Unknown nodes are ignored, not rejected.
        server.coordinate_update(update("ghost", Coordinate::new(8))).await.unwrap();
        assert_eq!(server.coordinate_get(get("ghost")).await.unwrap().coord, None);
    }

    #[tokio::test]
    async fn invalid_coordinates_are_rejected() {
        let server = test_server();
        let mut coord = Coordinate::new(8);
        coord.vec[3] = f64::NAN;
        let err = server.coordinate_update(update("foo", coord)).await.unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));

        let err = server
            .coordinate_update(update("foo", Coordinate::new(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
    }
}
