use crate::validate::{
    parse_execution_id, ExecutionsQuery, PageQuery, TriggerRequest, Validate,
};
use actix_web::http::StatusCode;
use actix_web::{delete, get, post, web, HttpRequest, HttpResponse, ResponseError};
use actix_ws::Message;
use orchcore::{OrchestratorError, WorkflowDefinition, WorkflowError};
use orchruntime::Orchestrator;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Rejected request: {}", .0.join("; "))]
    Rejected(Vec<String>),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Rejected(_) => StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::Workflow(WorkflowError::NotFound(_))
                | OrchestratorError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::Workflow(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("API error: {}", self);
        }
        let errors = match self {
            ApiError::Rejected(errors) => errors.clone(),
            ApiError::Orchestrator(e) => vec![e.to_string()],
        };
        HttpResponse::build(status).json(json!({ "success": false, "errors": errors }))
    }
}

fn validated<T: Validate>(value: T) -> Result<T, ApiError> {
    value.validate().map_err(ApiError::Rejected)?;
    Ok(value)
}

fn execution_id(raw: &str) -> Result<orchcore::ExecutionId, ApiError> {
    parse_execution_id(raw).map_err(ApiError::Rejected)
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "orchestrator",
        "activeExecutions": data.orchestrator.active_executions().await.len()
    }))
}

#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.orchestrator.list_workflows().await)
}

/// Create or replace a workflow definition
#[post("/api/workflows")]
async fn save_workflow(
    data: web::Data<AppState>,
    body: web::Json<WorkflowDefinition>,
) -> Result<HttpResponse, ApiError> {
    let definition = validated(body.into_inner())?;
    let workflow_id = definition.id.clone();
    data.orchestrator.save_workflow(definition).await?;
    Ok(HttpResponse::Created().json(json!({ "success": true, "id": workflow_id })))
}

#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let definition = data.orchestrator.get_workflow(&path).await?;
    Ok(HttpResponse::Ok().json(definition))
}

#[delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    data.orchestrator.delete_workflow(&path).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Workflow deleted successfully"
    })))
}

/// Start an execution. The body is optional; an empty one triggers with no
/// global variables.
#[post("/api/workflows/{id}/trigger")]
async fn trigger_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerRequest::default()
    } else {
        serde_json::from_slice::<TriggerRequest>(&body)
            .map_err(|e| ApiError::Rejected(vec![e.to_string()]))?
    };
    let request = validated(request)?;

    info!("Triggering workflow: {}", path.as_str());
    let response = data
        .orchestrator
        .trigger_workflow(&path, request.global_vars)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

#[get("/api/workflows/{id}/executions")]
async fn list_executions(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ExecutionsQuery>,
) -> Result<HttpResponse, ApiError> {
    let query = validated(query.into_inner())?;
    let executions = data
        .orchestrator
        .list_executions(&path, query.limit())
        .await?;
    Ok(HttpResponse::Ok().json(executions))
}

#[get("/api/executions")]
async fn list_execution_page(
    data: web::Data<AppState>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let query = validated(query.into_inner())?;
    let page = data
        .orchestrator
        .list_execution_page(query.page(), query.page_size())
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

#[get("/api/executions/{id}")]
async fn get_execution(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let record = data.orchestrator.get_execution(execution_id(&path)?).await?;
    Ok(HttpResponse::Ok().json(record))
}

#[post("/api/executions/{id}/cancel")]
async fn cancel_execution(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let response = data.orchestrator.cancel_execution(execution_id(&path)?).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/api/executions/{id}/retry")]
async fn retry_execution(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let response = data.orchestrator.retry_execution(execution_id(&path)?).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// What the event forwarder does with one read from the client side
#[derive(Debug, PartialEq)]
enum ClientAction {
    Pong(web::Bytes),
    Close,
    Ignore,
}

/// A closed or broken client stream ends the subscription
fn client_action(msg: Option<Result<Message, actix_ws::ProtocolError>>) -> ClientAction {
    match msg {
        Some(Ok(Message::Ping(bytes))) => ClientAction::Pong(bytes),
        Some(Ok(Message::Close(_))) | None => ClientAction::Close,
        Some(Ok(_)) => ClientAction::Ignore,
        Some(Err(e)) => {
            warn!("WebSocket protocol error: {}", e);
            ClientAction::Close
        }
    }
}

/// WebSocket stream of one execution's events, closed after the terminal event
#[get("/api/executions/{id}/events")]
async fn execution_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> actix_web::Result<HttpResponse> {
    let execution_id = execution_id(&path)?;
    // resolve before upgrading so unknown executions get a plain 404
    let mut subscription = data.orchestrator.subscribe(execution_id).await.map_err(ApiError::from)?;
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client subscribed to execution {}", execution_id);

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = subscription.next() => {
                    let Some(event) = event else { break };
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if session.text(json).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping unserializable event: {}", e),
                    }
                }

                msg = msg_stream.recv() => {
                    match client_action(msg) {
                        ClientAction::Pong(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        ClientAction::Close => break,
                        ClientAction::Ignore => {}
                    }
                }
            }
        }

        info!("WebSocket client of execution {} disconnected", execution_id);
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// Registered task types
#[get("/api/tasks")]
async fn list_tasks(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.orchestrator.list_tasks())
}

/// Routes plus extractor settings that turn malformed input into 400s
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::Rejected(vec![err.to_string()]).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::Rejected(vec![err.to_string()]).into()),
    )
    .service(health_check)
    .service(list_workflows)
    .service(save_workflow)
    .service(get_workflow)
    .service(delete_workflow)
    .service(trigger_workflow)
    .service(list_executions)
    .service(list_execution_page)
    .service(get_execution)
    .service(cancel_execution)
    .service(retry_execution)
    .service(execution_events)
    .service(list_tasks);
}
