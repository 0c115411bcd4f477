//! gRPC surface: OperationService backed by the operation manager and the
//! pipeline driver. Starts are idempotency-keyed; repeated starts return
//! the existing operation's state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

use trellis_pipeline::driver::OperationRequest;
use trellis_pipeline::operation::OperationSnapshot;
use trellis_pipeline::{OperationManager, PipelineDriver};
use trellis_rpc::pb;
use trellis_rpc::pb::operation_service_server::OperationService;

pub struct OperationApi {
    driver: Arc<PipelineDriver>,
    manager: Arc<OperationManager>,
    shutdown: CancellationToken,
}

impl OperationApi {
    pub fn new(driver: Arc<PipelineDriver>, shutdown: CancellationToken) -> Self {
        let manager = driver.manager();
        Self {
            driver,
            manager,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl OperationService for OperationApi {
    async fn start_operation(
        &self,
        request: Request<pb::StartOperationRequest>,
    ) -> Result<Response<pb::OperationState>, Status> {
        let req = request.into_inner();
        if req.template_id.is_empty() {
            return Err(Status::invalid_argument("templateId is required"));
        }

        let (operation_id, created) = self.manager.start(&req.kind, &req.idempotency_key);
        if created {
            info!(operation_id = %operation_id, kind = %req.kind, "Operation started");
            let driver = Arc::clone(&self.driver);
            let cancel = self.shutdown.child_token();
            let op_request = OperationRequest {
                kind: req.kind,
                template_id: req.template_id,
                endpoint_id: req.endpoint_id,
                parameters: req.parameters,
                idempotency_key: req.idempotency_key,
            };
            let id = operation_id.clone();
            tokio::spawn(async move {
                driver.execute(&id, op_request, cancel).await;
            });
        }

        let snapshot = self
            .manager
            .get(&operation_id)
            .ok_or_else(|| Status::internal("operation vanished after start"))?;
        Ok(Response::new(state_to_pb(snapshot)))
    }

    async fn get_operation(
        &self,
        request: Request<pb::GetOperationRequest>,
    ) -> Result<Response<pb::OperationState>, Status> {
        let req = request.into_inner();
        let snapshot = self
            .manager
            .get(&req.operation_id)
            .ok_or_else(|| Status::not_found(format!("unknown operation: {}", req.operation_id)))?;
        Ok(Response::new(state_to_pb(snapshot)))
    }
}

fn state_to_pb(snapshot: OperationSnapshot) -> pb::OperationState {
    let mut stats = std::collections::HashMap::new();
    stats.insert("slicesTotal".to_string(), snapshot.stats.slices_total.to_string());
    stats.insert("slicesDone".to_string(), snapshot.stats.slices_done.to_string());
    stats.insert(
        "recordsStaged".to_string(),
        snapshot.stats.records_staged.to_string(),
    );
    stats.insert("bytesStaged".to_string(), snapshot.stats.bytes_staged.to_string());
    stats.insert(
        "recordsWritten".to_string(),
        snapshot.stats.records_written.to_string(),
    );
    stats.insert("batches".to_string(), snapshot.stats.batches.to_string());
    if let Some(provider) = &snapshot.stats.staging_provider_id {
        stats.insert("stagingProviderId".to_string(), provider.clone());
    }
    if let Some(stage_ref) = &snapshot.stats.stage_ref {
        stats.insert("stageRef".to_string(), stage_ref.to_string());
    }

    pb::OperationState {
        operation_id: snapshot.operation_id,
        status: snapshot.status.to_string(),
        stats,
        error: snapshot.error.map(|e| pb::ErrorDetail {
            code: e.code.as_str().to_string(),
            message: e.message,
            retryable: e.retryable,
        }),
    }
}
