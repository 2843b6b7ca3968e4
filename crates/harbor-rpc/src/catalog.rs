//! `Catalog.*` endpoints.

use harbor_raft::Command;
use harbor_state::{
    DcSpecificRequest, DeregisterRequest, IndexedNodeServices, IndexedNodes, IndexedServiceNodes,
    IndexedServices, NodeSpecificRequest, RegisterRequest, ServiceNodesRequest, Table,
};
use tracing::debug;

use crate::blocking::sort_by_distance;
use crate::error::{RpcError, RpcResult};
use crate::server::RpcServer;

/// Names end up as composite key parts, which are `\0`-separated.
fn reject_nul(name: &str) -> RpcResult<()> {
    if name.contains('\0') {
        return Err(RpcError::Validation(format!("{name:?} contains a NUL character")));
    }
    Ok(())
}

impl RpcServer {
    pub async fn catalog_register(&self, mut req: RegisterRequest) -> RpcResult<()> {
        if let Some(done) = self
            .forward("Catalog.Register", &req.datacenter, None, &req)
            .await?
        {
            return Ok(done);
        }
        if req.node.is_empty() || req.address.is_empty() {
            return Err(RpcError::Validation("must provide node and address".into()));
        }
        if req.service.as_ref().is_some_and(|s| s.service.is_empty()) {
            return Err(RpcError::Validation("must provide service name".into()));
        }
        if req
            .check
            .as_ref()
            .is_some_and(|c| c.check_id.is_empty() && c.name.is_empty())
        {
            return Err(RpcError::Validation("must provide check name or id".into()));
        }
        if let Some(check) = &req.check {
            if !check.node.is_empty() && check.node != req.node {
                return Err(RpcError::Validation(format!(
                    "node {:?} for check {:?} does not match register request node {:?}",
                    check.node, check.check_id, req.node
                )));
            }
        }
        reject_nul(&req.node)?;
        if let Some(svc) = &req.service {
            reject_nul(&svc.id)?;
            reject_nul(&svc.service)?;
        }
        if let Some(check) = &req.check {
            reject_nul(&check.check_id)?;
            reject_nul(&check.name)?;
        }
        req.normalize();

        debug!(node = %req.node, service = ?req.service.as_ref().map(|s| &s.id),
            check = ?req.check.as_ref().map(|c| &c.check_id), "catalog register");
        self.raft_apply(Command::Register(req)).await?;
        Ok(())
    }

    pub async fn catalog_deregister(&self, req: DeregisterRequest) -> RpcResult<()> {
        if let Some(done) = self
            .forward("Catalog.Deregister", &req.datacenter, None, &req)
            .await?
        {
            return Ok(done);
        }
        if req.node.is_empty() {
            return Err(RpcError::Validation("must provide node".into()));
        }
        reject_nul(&req.node)?;
        for id in [&req.service_id, &req.check_id].into_iter().flatten() {
            reject_nul(id)?;
        }
        debug!(node = %req.node, service_id = ?req.service_id, check_id = ?req.check_id,
            "catalog deregister");
        self.raft_apply(Command::Deregister(req)).await?;
        Ok(())
    }

    /// Datacenters with at least one known server, always including ours.
    pub async fn catalog_list_datacenters(&self, _req: ()) -> RpcResult<Vec<String>> {
        let mut dcs = self.membership.datacenters();
        if !dcs.contains(&self.config.datacenter) {
            dcs.push(self.config.datacenter.clone());
            dcs.sort();
        }
        Ok(dcs)
    }

    pub async fn catalog_list_nodes(&self, req: DcSpecificRequest) -> RpcResult<IndexedNodes> {
        if let Some(reply) = self
            .forward("Catalog.ListNodes", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (nodes, meta) = self
            .blocking_query(&req.options, &[Table::Nodes], |snap| {
                let mut nodes = snap.nodes()?;
                sort_by_distance(snap, req.near.as_deref(), &mut nodes, |n| n.node.as_str())?;
                Ok(nodes)
            })
            .await?;
        Ok(IndexedNodes { nodes, meta })
    }

    pub async fn catalog_list_services(
        &self,
        req: DcSpecificRequest,
    ) -> RpcResult<IndexedServices> {
        if let Some(reply) = self
            .forward("Catalog.ListServices", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (services, meta) = self
            .blocking_query(&req.options, &[Table::Services], |snap| snap.services())
            .await?;
        Ok(IndexedServices { services, meta })
    }

    pub async fn catalog_service_nodes(
        &self,
        req: ServiceNodesRequest,
    ) -> RpcResult<IndexedServiceNodes> {
        if let Some(reply) = self
            .forward("Catalog.ServiceNodes", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        if req.service_name.is_empty() {
            return Err(RpcError::Validation("must provide service name".into()));
        }
        let (service_nodes, meta) = self
            .blocking_query(&req.options, &[Table::Nodes, Table::Services], |snap| {
                let mut out = match req.service_tag.as_deref() {
                    Some(tag) => snap.service_tag_nodes(&req.service_name, tag)?,
                    None => snap.service_nodes(&req.service_name)?,
                };
                sort_by_distance(snap, req.near.as_deref(), &mut out, |sn| sn.node.as_str())?;
                Ok(out)
            })
            .await?;
        Ok(IndexedServiceNodes {
            service_nodes,
            meta,
        })
    }

    pub async fn catalog_node_services(
        &self,
        req: NodeSpecificRequest,
    ) -> RpcResult<IndexedNodeServices> {
        if let Some(reply) = self
            .forward("Catalog.NodeServices", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        if req.node.is_empty() {
            return Err(RpcError::Validation("must provide node".into()));
        }
        let (node_services, meta) = self
            .blocking_query(&req.options, &[Table::Nodes, Table::Services], |snap| {
                snap.node_services(&req.node)
            })
            .await?;
        Ok(IndexedNodeServices {
            node_services,
            meta,
        })
    }
}
