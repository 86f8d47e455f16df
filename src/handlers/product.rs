// src/handlers/product.rs
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    Json,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use crate::database::is_unique_violation;
use crate::dtos::product::{
    DeleteProductResponse, ListProductsQuery, NewProduct, PaginationMeta, ProductChanges,
    ProductListResponse, ProductResponse,
};
use crate::extract::{ProductForm, ProductId};
use crate::models::product::{Product, PRODUCT_COLUMNS};
use crate::state::AppState;
use crate::error::AppError;
use crate::upload::StoredImage;
use tracing::{info, instrument};

const SLUG_TAKEN: &str = "Product slug already exists";
const NOT_FOUND: &str = "Product not found";
const FETCH_LIST_FAILED: &str = "Failed to fetch products";
const FETCH_FAILED: &str = "Failed to fetch product";
const CREATE_FAILED: &str = "Failed to create product";
const UPDATE_FAILED: &str = "Failed to update product";
const DELETE_FAILED: &str = "Failed to delete product";

fn map_unique_violation(err: sqlx::Error, context: &'static str) -> AppError {
    if is_unique_violation(&err) {
        AppError::conflict(SLUG_TAKEN)
    } else {
        AppError::storage(context)(err)
    }
}

// GET /api/products - List products, paginated and filtered
#[instrument(skip(state))]
pub async fn get_products(
    State(state): State<AppState>,
    query: Result<Query<ListProductsQuery>, QueryRejection>,
) -> Result<Json<ProductListResponse>, AppError> {
    let Query(query) = query?;
    let (page, limit) = query.page_and_limit();
    let offset = (page - 1).saturating_mul(limit);
    let filter = query.filter();

    let products = filter
        .select_page(limit, offset)
        .build_query_as::<Product>()
        .fetch_all(&state.db_pool)
        .await
        .map_err(AppError::storage(FETCH_LIST_FAILED))?;

    let total: i64 = filter
        .count()
        .build_query_scalar()
        .fetch_one(&state.db_pool)
        .await
        .map_err(AppError::storage(FETCH_LIST_FAILED))?;

    Ok(Json(ProductListResponse {
        data: products.into_iter().map(ProductResponse::from).collect(),
        pagination: PaginationMeta::new(total, page, limit),
    }))
}

// GET /api/products/:id - Get single product
#[instrument(skip(state))]
pub async fn get_product(
    ProductId(id): ProductId,
    State(state): State<AppState>,
) -> Result<Json<ProductResponse>, AppError> {
    let product = find_product(&state.db_pool, id, FETCH_FAILED)
        .await?
        .ok_or_else(|| AppError::not_found(NOT_FOUND))?;

    Ok(Json(ProductResponse::from(product)))
}

// POST /api/products - Create new product
#[instrument(skip(state, form))]
pub async fn create_product(
    State(state): State<AppState>,
    form: ProductForm,
) -> Result<(StatusCode, Json<ProductResponse>), AppError> {
    let ProductForm { fields, image } = form;

    let result = async {
        let payload = fields.into_new_product()?;
        insert_product(&state.db_pool, &payload, image.as_ref()).await
    }
    .await;

    match result {
        Ok(product) => {
            info!(id = product.id, slug = %product.slug, "Created product");
            Ok((StatusCode::CREATED, Json(ProductResponse::from(product))))
        }
        Err(e) => {
            if let Some(stored) = &image {
                state.uploads.discard(stored).await;
            }
            Err(e)
        }
    }
}

// PUT /api/products/:id - Update product
#[instrument(skip(state, form))]
pub async fn update_product(
    ProductId(id): ProductId,
    State(state): State<AppState>,
    form: ProductForm,
) -> Result<Json<ProductResponse>, AppError> {
    let ProductForm { fields, image } = form;

    let result = async {
        // Check if product exists
        let existing = find_product(&state.db_pool, id, UPDATE_FAILED)
            .await?
            .ok_or_else(|| AppError::not_found(NOT_FOUND))?;

        let changes = fields.into_changes()?;

        let updated = apply_changes(&state.db_pool, id, &changes, image.as_ref())
            .await?
            .ok_or_else(|| AppError::not_found(NOT_FOUND))?;

        Ok::<_, AppError>((existing, updated))
    }
    .await;

    match result {
        Ok((existing, updated)) => {
            if image.is_some() {
                if let Some(old) = existing.image_url.as_deref() {
                    state.uploads.remove_public(old).await;
                }
            }
            info!(id, "Updated product");
            Ok(Json(ProductResponse::from(updated)))
        }
        Err(e) => {
            if let Some(stored) = &image {
                state.uploads.discard(stored).await;
            }
            Err(e)
        }
    }
}

// DELETE /api/products/:id - Delete product
#[instrument(skip(state))]
pub async fn delete_product(
    ProductId(id): ProductId,
    State(state): State<AppState>,
) -> Result<Json<DeleteProductResponse>, AppError> {
    let deleted: Option<Option<String>> =
        sqlx::query_scalar("DELETE FROM products WHERE id = $1 RETURNING image_url")
            .bind(id)
            .fetch_optional(&state.db_pool)
            .await
            .map_err(AppError::storage(DELETE_FAILED))?;

    let Some(image_url) = deleted else {
        return Err(AppError::not_found(NOT_FOUND));
    };

    if let Some(url) = image_url.as_deref() {
        state.uploads.remove_public(url).await;
    }
    info!(id, "Deleted product");

    Ok(Json(DeleteProductResponse {
        message: "Product deleted successfully",
        id,
    }))
}

async fn find_product(
    pool: &PgPool,
    id: i64,
    context: &'static str,
) -> Result<Option<Product>, AppError> {
    let product = sqlx::query_as::<_, Product>(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::storage(context))?;

    Ok(product)
}

async fn insert_product(
    pool: &PgPool,
    payload: &NewProduct,
    image: Option<&StoredImage>,
) -> Result<Product, AppError> {
    sqlx::query_as::<_, Product>(&format!(
        "INSERT INTO products (name, slug, description, price, category, stock, image_url)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING {PRODUCT_COLUMNS}"
    ))
    .bind(&payload.name)
    .bind(&payload.slug)
    .bind(&payload.description)
    .bind(payload.price)
    .bind(&payload.category)
    .bind(payload.stock)
    .bind(image.map(|i| i.public_url.as_str()))
    .fetch_one(pool)
    .await
    .map_err(|e| map_unique_violation(e, CREATE_FAILED))
}

/// Applies a partial update. Returns `None` when the row vanished between the
/// existence check and the update.
async fn apply_changes(
    pool: &PgPool,
    id: i64,
    changes: &ProductChanges,
    image: Option<&StoredImage>,
) -> Result<Option<Product>, AppError> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE products SET ");
    let mut set = qb.separated(", ");

    set.push("name = COALESCE(")
        .push_bind_unseparated(changes.name.clone())
        .push_unseparated(", name)");
    set.push("slug = COALESCE(")
        .push_bind_unseparated(changes.slug.clone())
        .push_unseparated(", slug)");
    set.push("price = COALESCE(")
        .push_bind_unseparated(changes.price)
        .push_unseparated("::FLOAT8, price::FLOAT8)");
    set.push("category = COALESCE(")
        .push_bind_unseparated(changes.category.clone())
        .push_unseparated(", category)");
    set.push("stock = COALESCE(")
        .push_bind_unseparated(changes.stock)
        .push_unseparated(", stock)");
    if let Some(description) = &changes.description {
        set.push("description = ").push_bind_unseparated(description.clone());
    }
    if let Some(image) = image {
        set.push("image_url = ").push_bind_unseparated(image.public_url.clone());
    }

    qb.push(" WHERE id = ")
        .push_bind(id)
        .push(format!(" RETURNING {PRODUCT_COLUMNS}"));

    qb.build_query_as::<Product>()
        .fetch_optional(pool)
        .await
        .map_err(|e| map_unique_violation(e, UPDATE_FAILED))
}
