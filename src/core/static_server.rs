use actix_web::{web, HttpResponse};
use mime_guess::from_path;
use rust_embed::RustEmbed;

use crate::core::errors::ApiError;

#[derive(RustEmbed)]
#[folder = "static"]
pub(crate) struct Assets;

pub fn asset_text(name: &str) -> anyhow::Result<String> {
    let file = Assets::get(name).ok_or_else(|| anyhow::anyhow!("Asset {} not found", name))?;
    Ok(String::from_utf8(file.data.into_owned())?)
}

pub async fn serve_static(path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let file_path = path.into_inner();

    // Templates live next to the public assets but are not served directly.
    if file_path.ends_with(".html") {
        return Err(ApiError::NotFound("File not found".to_string()));
    }

    let file = Assets::get(&file_path)
        .ok_or_else(|| ApiError::NotFound("File not found".to_string()))?;

    let mime = from_path(&file_path).first_or_octet_stream();

    Ok(HttpResponse::Ok()
        .content_type(mime.as_ref())
        .body(file.data.into_owned()))
}
