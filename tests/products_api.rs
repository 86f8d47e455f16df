use std::path::PathBuf;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use catalog_api::{create_router, upload::UploadStore, AppState};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::OnceCell;
use tower::ServiceExt;
use uuid::Uuid;

const MB: usize = 1024 * 1024;

static SCHEMA: OnceCell<()> = OnceCell::const_new();

struct TestApp {
    router: Router,
    upload_dir: PathBuf,
}

fn temp_upload_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("catalog-api-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create upload dir");
    dir
}

/// App whose pool never connects; for requests rejected before storage.
fn app_without_db() -> TestApp {
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(2))
        .connect_lazy("postgres://postgres@127.0.0.1:1/unused")
        .expect("lazy pool");
    let upload_dir = temp_upload_dir();
    let state = AppState::new(pool, UploadStore::new(&upload_dir));
    TestApp { router: create_router(state), upload_dir }
}

/// App backed by `DATABASE_URL`; `None` skips the test when it is unset.
async fn app_with_db() -> Option<TestApp> {
    if std::env::var("SKIP_DB_TESTS").is_ok() {
        return None;
    }
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL missing; skipping database test");
        return None;
    };

    SCHEMA
        .get_or_init(|| async {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&url)
                .await
                .expect("connect for schema");
            sqlx::raw_sql(include_str!("../schema.sql"))
                .execute(&pool)
                .await
                .expect("apply schema");
            pool.close().await;
        })
        .await;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect");
    let upload_dir = temp_upload_dir();
    let state = AppState::new(pool, UploadStore::new(&upload_dir));
    Some(TestApp { router: create_router(state), upload_dir })
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(req).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn send_json(&self, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(req).await
    }

    async fn send_multipart(&self, method: Method, uri: &str, form: MultipartForm) -> (StatusCode, Value) {
        let (content_type, body) = form.finish();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        self.send(req).await
    }

    async fn create(&self, body: Value) -> Value {
        let (status, product) = self.send_json(Method::POST, "/api/products", body).await;
        assert_eq!(status, StatusCode::CREATED, "{product}");
        product
    }

    fn stored_files(&self) -> usize {
        std::fs::read_dir(&self.upload_dir).map(|d| d.count()).unwrap_or(0)
    }
}

struct MultipartForm {
    boundary: String,
    buf: Vec<u8>,
}

impl MultipartForm {
    fn new() -> Self {
        Self { boundary: format!("test-{}", Uuid::new_v4().simple()), buf: Vec::new() }
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.buf.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self
    }

    fn file(mut self, name: &str, file_name: &str, content_type: &str, data: &[u8]) -> Self {
        self.buf.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    fn finish(mut self) -> (String, Vec<u8>) {
        self.buf.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (format!("multipart/form-data; boundary={}", self.boundary), self.buf)
    }
}

fn product_form(slug: &str) -> MultipartForm {
    MultipartForm::new()
        .text("name", "Ceramic Mug")
        .text("slug", slug)
        .text("price", "12.50")
        .text("category", "kitchen")
}

fn unique_slug(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn rejects_non_image_upload() {
    let app = app_without_db();
    let form = product_form("mug").file("image", "notes.txt", "text/plain", b"hello");

    let (status, body) = app.send_multipart(Method::POST, "/api/products", form).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Only image files are allowed!");
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn rejects_oversized_image() {
    let app = app_without_db();
    let data = vec![0u8; 6 * MB];
    let form = product_form("big").file("image", "big.png", "image/png", &data);

    let (status, body) = app.send_multipart(Method::POST, "/api/products", form).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["error"].is_string());
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn rejects_file_in_unexpected_field() {
    let app = app_without_db();
    let form = product_form("mug").file("avatar", "a.png", "image/png", b"png");

    let (status, body) = app.send_multipart(Method::POST, "/api/products", form).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Unexpected file field: avatar");
}

#[tokio::test]
async fn missing_fields_discard_the_upload() {
    let app = app_without_db();
    let form = MultipartForm::new()
        .text("name", "Mug")
        .file("image", "mug.jpg", "image/jpeg", &[1u8; 1024]);

    let (status, body) = app.send_multipart(Method::POST, "/api/products", form).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required fields: name, slug, price, category");
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn missing_fields_in_json_body() {
    let app = app_without_db();
    let (status, body) = app
        .send_json(Method::POST, "/api/products", json!({ "name": "Mug", "price": 3 }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required fields: name, slug, price, category");
}

#[tokio::test]
async fn non_numeric_pagination_is_rejected() {
    let app = app_without_db();
    let (status, body) = app.get("/api/products?page=two").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn non_numeric_id_is_not_found() {
    let app = app_without_db();

    let (status, body) = app.get("/api/products/abc").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Product not found");

    let (status, body) = app
        .send_json(Method::PUT, "/api/products/abc", json!({ "name": "Ghost" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Product not found");

    let (status, body) = app
        .send(Request::delete("/api/products/abc").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Product not found");
}

#[tokio::test]
async fn oversized_json_body_is_payload_too_large() {
    let app = app_without_db();
    let padding = "x".repeat(7 * MB);

    let (status, body) = app
        .send_json(
            Method::POST,
            "/api/products",
            json!({ "name": "Mug", "slug": "mug", "price": 1, "category": "k", "description": padding }),
        )
        .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn oversized_form_body_is_payload_too_large() {
    let app = app_without_db();
    let body = format!("name=Mug&slug=mug&price=1&category=k&description={}", "x".repeat(7 * MB));
    let req = Request::post("/api/products")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();

    let (status, body) = app.send(req).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn health_reports_unreachable_database() {
    let app = app_without_db();
    let (status, body) = app.get("/health").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn list_reports_storage_failure() {
    let app = app_without_db();
    let (status, body) = app.get("/api/products").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Failed to fetch products");
}

#[tokio::test]
async fn health_reports_database() {
    let Some(app) = app_with_db().await else { return };
    let (status, body) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db"], true);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn creates_and_fetches_product() {
    let Some(app) = app_with_db().await else { return };
    let slug = unique_slug("lamp");

    let created = app
        .create(json!({
            "name": "Desk Lamp",
            "slug": slug,
            "description": "Warm light",
            "price": "39.90",
            "category": "home"
        }))
        .await;

    assert!(created["id"].as_i64().is_some());
    assert!(created["createdAt"].is_string());
    assert_eq!(created["name"], "Desk Lamp");
    assert_eq!(created["slug"], slug.as_str());
    assert_eq!(created["description"], "Warm light");
    assert_eq!(created["price"], 39.9);
    assert_eq!(created["category"], "home");
    assert_eq!(created["stock"], 0);
    assert_eq!(created["imageUrl"], Value::Null);

    let (status, fetched) = app.get(&format!("/api/products/{}", created["id"])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn duplicate_slug_is_a_conflict() {
    let Some(app) = app_with_db().await else { return };
    let slug = unique_slug("dup");

    let first = app
        .create(json!({ "name": "First", "slug": slug, "price": 5, "category": "misc", "stock": 3 }))
        .await;

    let (status, body) = app
        .send_json(
            Method::POST,
            "/api/products",
            json!({ "name": "Second", "slug": slug, "price": 7, "category": "misc" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Product slug already exists");

    let (_, unchanged) = app.get(&format!("/api/products/{}", first["id"])).await;
    assert_eq!(unchanged, first);
}

#[tokio::test]
async fn duplicate_slug_discards_uploaded_image() {
    let Some(app) = app_with_db().await else { return };
    let slug = unique_slug("dup-image");
    app.create(json!({ "name": "First", "slug": slug, "price": 5, "category": "misc" }))
        .await;

    let form = product_form(&slug).file("image", "copy.png", "image/png", b"copy");
    let (status, body) = app.send_multipart(Method::POST, "/api/products", form).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Product slug already exists");
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let Some(app) = app_with_db().await else { return };
    let (status, body) = app.get(&format!("/api/products/{}", i64::MAX)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Product not found");
}

#[tokio::test]
async fn lists_second_page_newest_first() {
    let Some(app) = app_with_db().await else { return };
    let category = unique_slug("page");

    for i in 0..25 {
        app.create(json!({
            "name": format!("item-{i}"),
            "slug": unique_slug("item"),
            "price": 1,
            "category": category,
        }))
        .await;
    }

    let (status, body) = app
        .get(&format!("/api/products?category={category}&limit=10&page=2"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    let expected: Vec<String> = (5..15).rev().map(|i| format!("item-{i}")).collect();
    assert_eq!(names, expected);

    assert_eq!(
        body["pagination"],
        json!({ "total": 25, "page": 2, "limit": 10, "totalPages": 3 })
    );
}

#[tokio::test]
async fn search_matches_name_or_description() {
    let Some(app) = app_with_db().await else { return };
    let category = unique_slug("search");
    let marker = Uuid::new_v4().simple().to_string();

    app.create(json!({ "name": format!("Kettle {marker}"), "slug": unique_slug("k"), "price": 20, "category": category }))
        .await;
    app.create(json!({ "name": "Teapot", "description": format!("pairs with {}", marker.to_uppercase()), "slug": unique_slug("t"), "price": 15, "category": category }))
        .await;
    app.create(json!({ "name": "Spoon", "slug": unique_slug("s"), "price": 2, "category": category }))
        .await;

    let (status, body) = app
        .get(&format!("/api/products?category={category}&search={marker}"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn deletes_product() {
    let Some(app) = app_with_db().await else { return };
    let created = app
        .create(json!({ "name": "Bin", "slug": unique_slug("bin"), "price": 3, "category": "misc" }))
        .await;
    let id = created["id"].as_i64().unwrap();
    let uri = format!("/api/products/{id}");

    let delete = || Request::delete(uri.as_str()).body(Body::empty()).unwrap();

    let (status, body) = app.send(delete()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "message": "Product deleted successfully", "id": id }));

    let (status, _) = app.get(&uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.send(delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_product_removes_its_image() {
    let Some(app) = app_with_db().await else { return };
    let form = product_form(&unique_slug("framed")).file("image", "frame.gif", "image/gif", b"gif");
    let (status, created) = app.send_multipart(Method::POST, "/api/products", form).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(app.stored_files(), 1);

    let uri = format!("/api/products/{}", created["id"]);
    let (status, _) = app.send(Request::delete(uri.as_str()).body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn accepts_image_and_serves_it() {
    let Some(app) = app_with_db().await else { return };
    let data = vec![7u8; 2 * MB];
    let form = product_form(&unique_slug("photo")).file("image", "photo.jpg", "image/jpeg", &data);

    let (status, product) = app.send_multipart(Method::POST, "/api/products", form).await;
    assert_eq!(status, StatusCode::CREATED, "{product}");

    let image_url = product["imageUrl"].as_str().expect("imageUrl set");
    assert!(image_url.starts_with("/uploads/"));
    assert!(image_url.ends_with(".jpg"));

    let response = app
        .router
        .clone()
        .oneshot(Request::get(image_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 2 * MB);
}

#[tokio::test]
async fn update_patches_only_supplied_fields() {
    let Some(app) = app_with_db().await else { return };
    let form = product_form(&unique_slug("patch"))
        .text("stock", "4")
        .file("image", "first.png", "image/png", b"first");
    let (_, created) = app.send_multipart(Method::POST, "/api/products", form).await;
    let uri = format!("/api/products/{}", created["id"]);

    let form = MultipartForm::new().text("price", "15").text("description", "Now bigger");
    let (status, updated) = app.send_multipart(Method::PUT, &uri, form).await;

    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["price"], 15.0);
    assert_eq!(updated["description"], "Now bigger");
    assert_eq!(updated["name"], created["name"]);
    assert_eq!(updated["slug"], created["slug"]);
    assert_eq!(updated["stock"], 4);
    assert_eq!(updated["imageUrl"], created["imageUrl"]);
    assert_eq!(updated["createdAt"], created["createdAt"]);
}

#[tokio::test]
async fn update_with_new_image_replaces_old_file() {
    let Some(app) = app_with_db().await else { return };
    let form = product_form(&unique_slug("swap")).file("image", "old.png", "image/png", b"old");
    let (_, created) = app.send_multipart(Method::POST, "/api/products", form).await;
    assert_eq!(app.stored_files(), 1);

    let uri = format!("/api/products/{}", created["id"]);
    let form = MultipartForm::new().file("image", "new.webp", "image/webp", b"new");
    let (status, updated) = app.send_multipart(Method::PUT, &uri, form).await;

    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_ne!(updated["imageUrl"], created["imageUrl"]);
    assert!(updated["imageUrl"].as_str().unwrap().ends_with(".webp"));
    assert_eq!(app.stored_files(), 1);
}

#[tokio::test]
async fn update_unknown_product_is_not_found() {
    let Some(app) = app_with_db().await else { return };
    let form = MultipartForm::new()
        .text("name", "Ghost")
        .file("image", "ghost.gif", "image/gif", b"gif");

    let (status, _) = app
        .send_multipart(Method::PUT, &format!("/api/products/{}", i64::MAX), form)
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn update_to_taken_slug_is_a_conflict() {
    let Some(app) = app_with_db().await else { return };
    let taken = unique_slug("taken");
    app.create(json!({ "name": "A", "slug": taken, "price": 1, "category": "misc" })).await;
    let other = app
        .create(json!({ "name": "B", "slug": unique_slug("b"), "price": 1, "category": "misc" }))
        .await;

    let (status, body) = app
        .send_json(Method::PUT, &format!("/api/products/{}", other["id"]), json!({ "slug": taken }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Product slug already exists");
}
