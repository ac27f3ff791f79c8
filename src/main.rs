use axum::{
    body::Body,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rust_embed::RustEmbed;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Embed frontend static files (compile-time embed from frontend/dist) / 嵌入前端静态文件
#[derive(RustEmbed)]
#[folder = "frontend/dist"]
struct FrontendAssets;

mod api;
mod state;

use rclone_panel_backend::rclone::{RcClient, RcServer};
use rclone_panel_backend::task::TaskManager;
use rclone_panel_backend::{config, db};
use state::AppState;

fn embedded_response(path: &str, content_type: &str, data: Vec<u8>) -> Response {
    let mut response = Body::from(data).into_response();
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    } else {
        tracing::debug!("Unusable content type for {}: {}", path, content_type);
    }
    response
}

/// Handle embedded static file requests / 处理嵌入的静态文件请求
async fn serve_embedded_file(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');

    // Try to get requested file / 尝试获取请求的文件
    if let Some(content) = FrontendAssets::get(path) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        return embedded_response(path, mime.as_ref(), content.data.into_owned());
    }

    // API 路径不回退到 index.html
    if path.starts_with("api/") {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    // If directory or file not found, try return index.html (SPA routing support) / 目录或文件不存在时返回index.html
    if let Some(content) = FrontendAssets::get("index.html") {
        return embedded_response("index.html", "text/html; charset=utf-8", content.data.into_owned());
    }

    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api::server::health_check))
        // 任务
        .route("/api/tasks", get(api::tasks::list_tasks))
        .route("/api/tasks/create", post(api::tasks::create_task))
        .route("/api/tasks/get", post(api::tasks::get_task))
        .route("/api/tasks/progress", post(api::tasks::get_task_progress))
        .route("/api/tasks/cancel", post(api::tasks::cancel_task))
        .route("/api/tasks/pause", post(api::tasks::pause_task))
        .route("/api/tasks/resume", post(api::tasks::resume_task))
        .route("/api/tasks/retry", post(api::tasks::retry_task))
        .route("/api/tasks/remove", post(api::tasks::remove_task))
        .route("/api/tasks/clear", post(api::tasks::clear_finished))
        .route("/api/tasks/events", get(api::tasks::task_events))
        // 远程存储
        .route("/api/remotes", get(api::remotes::list_remotes).post(api::remotes::create_remote))
        .route("/api/remotes/:id", get(api::remotes::get_remote).post(api::remotes::update_remote))
        .route("/api/remotes/:id/delete", post(api::remotes::delete_remote))
        // rclone 本体
        .route("/api/rclone/status", get(api::rclone::rclone_status))
        .route("/api/rclone/remotes", get(api::rclone::configured_remotes))
        .route("/api/rclone/config", get(api::rclone::read_config).post(api::rclone::write_config))
        // rc 服务
        .route("/api/rc/status", get(api::rc::rc_status))
        .route("/api/rc/start", post(api::rc::rc_start))
        .route("/api/rc/stop", post(api::rc::rc_stop))
        .route("/api/rc/restart", post(api::rc::rc_restart))
        .route("/api/rc/stats", get(api::rc::rc_stats))
        .route("/api/rc/jobs", get(api::rc::rc_jobs))
        .route("/api/rc/job", post(api::rc::rc_job))
        .route("/api/rc/bwlimit", get(api::rc::get_bwlimit).post(api::rc::set_bwlimit))
        .route("/api/rc/call", post(api::rc::rc_call))
        // Embedded frontend static files
        .fallback(serve_embedded_file)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rclone_panel_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration / 加载配置
    let app_config = config::load_config().map_err(anyhow::Error::msg)?;
    tracing::info!("Server will listen on {}:{}", app_config.server.host, app_config.server.port);

    // Create data directory if not exists / 创建数据目录
    let data_dir = app_config.get_data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!("Created data directory: {:?}", data_dir);
    }

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| app_config.get_database_url());

    let pool = SqlitePool::connect(&database_url).await?;

    db::run_migrations(&pool).await?;

    let rc = Arc::new(RcClient::new(&app_config.rclone)?);
    let rc_server = Arc::new(RcServer::new(app_config.rclone.clone(), rc.clone()));

    let task_manager = TaskManager::new(
        pool.clone(),
        rc.clone(),
        app_config.rclone.clone(),
        &app_config.tasks,
    );

    // Load tasks from database / 从数据库加载任务
    let recovered = task_manager.recover_on_startup().await?;
    if recovered > 0 {
        tracing::warn!("{} tasks were interrupted by the previous shutdown", recovered);
    }
    task_manager.start_background();

    let bind_addr = app_config.get_bind_address();
    let state = Arc::new(AppState {
        db: pool,
        task_manager: task_manager.clone(),
        rc,
        rc_server,
        config: Arc::new(app_config),
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server running at http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    task_manager.shutdown();
    tracing::info!("Server stopped");

    Ok(())
}
