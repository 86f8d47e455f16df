// src/extract.rs
use axum::extract::{FromRequest, FromRequestParts, Multipart, Path, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::{Form, Json};

use crate::dtos::product::ProductFields;
use crate::error::AppError;
use crate::state::AppState;
use crate::upload::{StoredImage, UploadError, UploadStore};

/// Form field that carries the product image.
pub const IMAGE_FIELD: &str = "image";

/// Numeric product id from the `{id}` path segment. Anything that does not
/// parse is answered like an unknown id.
#[derive(Debug, Clone, Copy)]
pub struct ProductId(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for ProductId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<i64>::from_request_parts(parts, state).await?;
        Ok(ProductId(id))
    }
}

/// Product fields plus an optional image, read from a multipart, JSON or
/// urlencoded body. The image is already on disk when extraction succeeds.
#[derive(Debug)]
pub struct ProductForm {
    pub fields: ProductFields,
    pub image: Option<StoredImage>,
}

impl FromRequest<AppState> for ProductForm {
    type Rejection = AppError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state).await?;
            return read_multipart(multipart, &state.uploads).await;
        }

        let fields = if content_type.starts_with("application/json") {
            let Json(fields) = Json::<ProductFields>::from_request(req, state).await?;
            fields
        } else {
            let Form(fields) = Form::<ProductFields>::from_request(req, state).await?;
            fields
        };

        Ok(ProductForm { fields, image: None })
    }
}

async fn read_multipart(mut multipart: Multipart, uploads: &UploadStore) -> Result<ProductForm, AppError> {
    let mut fields = ProductFields::default();
    let mut image: Option<StoredImage> = None;

    let result = async {
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);

            match file_name {
                // A file input left empty by the browser.
                Some(f) if f.is_empty() => continue,
                Some(f) => {
                    if name != IMAGE_FIELD || image.is_some() {
                        return Err(AppError::from(UploadError::UnexpectedFile(name)));
                    }
                    let content_type = field.content_type().map(str::to_string);
                    let stored = uploads.save(&f, content_type.as_deref(), field).await?;
                    image = Some(stored);
                }
                None => {
                    let value = field.text().await?;
                    fields.set(&name, value);
                }
            }
        }
        Ok::<_, AppError>(())
    }
    .await;

    match result {
        Ok(()) => Ok(ProductForm { fields, image }),
        Err(e) => {
            if let Some(stored) = &image {
                uploads.discard(stored).await;
            }
            Err(e)
        }
    }
}
