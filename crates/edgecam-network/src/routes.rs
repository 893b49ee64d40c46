use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::{AppContext, AppResult};

pub const GREETING: &str = "Hello from the edgecam agent! Try /image.jpg /postimage /timezone";

pub fn router() -> Router<AppContext> {
    Router::new()
        .route("/", get(index))
        .route("/image.jpg", get(image))
        .route("/timezone", get(timezone))
        .route("/postimage", get(post_image))
}

async fn index() -> &'static str {
    GREETING
}

async fn image(State(ctx): State<AppContext>) -> AppResult<impl IntoResponse> {
    let image = ctx.dispatcher.capture().await?;
    Ok(([(CONTENT_TYPE, "image/jpeg")], image.jpeg))
}

async fn timezone(State(ctx): State<AppContext>) -> String {
    format!("The timezone is: {}h", ctx.dispatcher.camera().timezone())
}

async fn post_image(State(ctx): State<AppContext>) -> AppResult<String> {
    ctx.dispatcher.capture_and_upload().await?;
    Ok(format!("image posted {}", ctx.dispatcher.public_url()))
}
