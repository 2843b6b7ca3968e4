//! `Health.*` endpoints.

use harbor_state::{
    ChecksInStateRequest, HealthStatus, IndexedCheckServiceNodes, IndexedHealthChecks,
    NodeSpecificRequest, ServiceNodesRequest, Table,
};

use crate::blocking::sort_by_distance;
use crate::error::{RpcError, RpcResult};
use crate::server::RpcServer;

impl RpcServer {
    pub async fn health_node_checks(
        &self,
        req: NodeSpecificRequest,
    ) -> RpcResult<IndexedHealthChecks> {
        if let Some(reply) = self
            .forward("Health.NodeChecks", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (checks, meta) = self
            .blocking_query(&req.options, &[Table::Checks], |snap| snap.node_checks(&req.node))
            .await?;
        Ok(IndexedHealthChecks { checks, meta })
    }

    pub async fn health_service_checks(
        &self,
        req: ServiceNodesRequest,
    ) -> RpcResult<IndexedHealthChecks> {
        if let Some(reply) = self
            .forward("Health.ServiceChecks", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        if req.service_name.is_empty() {
            return Err(RpcError::Validation("must provide service name".into()));
        }
        let (checks, meta) = self
            .blocking_query(&req.options, &[Table::Checks], |snap| {
                let mut checks = snap.service_checks(&req.service_name)?;
                sort_by_distance(snap, req.near.as_deref(), &mut checks, |c| c.node.as_str())?;
                Ok(checks)
            })
            .await?;
        Ok(IndexedHealthChecks { checks, meta })
    }

    pub async fn health_checks_in_state(
        &self,
        req: ChecksInStateRequest,
    ) -> RpcResult<IndexedHealthChecks> {
        if let Some(reply) = self
            .forward("Health.ChecksInState", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        let (checks, meta) = self
            .blocking_query(&req.options, &[Table::Checks], |snap| {
                snap.checks_in_state(req.state)
            })
            .await?;
        Ok(IndexedHealthChecks { checks, meta })
    }

    /// Instances of a service joined with their checks. With
    /// `passing_only`, instances with any non-passing check are dropped.
    pub async fn health_service_nodes(
        &self,
        req: ServiceNodesRequest,
    ) -> RpcResult<IndexedCheckServiceNodes> {
        if let Some(reply) = self
            .forward("Health.ServiceNodes", &req.datacenter, Some(&req.options), &req)
            .await?
        {
            return Ok(reply);
        }
        if req.service_name.is_empty() {
            return Err(RpcError::Validation("must provide service name".into()));
        }
        let tables = [Table::Nodes, Table::Services, Table::Checks];
        let (nodes, meta) = self
            .blocking_query(&req.options, &tables, |snap| {
                let mut nodes = match req.service_tag.as_deref() {
                    Some(tag) => snap.check_service_tag_nodes(&req.service_name, tag)?,
                    None => snap.check_service_nodes(&req.service_name)?,
                };
                if req.passing_only {
                    nodes.retain(|n| n.checks.iter().all(|c| c.status == HealthStatus::Passing));
                }
                sort_by_distance(snap, req.near.as_deref(), &mut nodes, |n| n.node.node.as_str())?;
                Ok(nodes)
            })
            .await?;
        Ok(IndexedCheckServiceNodes { nodes, meta })
    }
}
