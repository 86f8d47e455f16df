// src/dtos/product.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::product::{Product, ProductFilter};

pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Largest value a NUMERIC(10, 2) column holds.
const MAX_PRICE: f64 = 99_999_999.99;

const MISSING_FIELDS: &str = "Missing required fields: name, slug, price, category";

/// Product fields as they arrive on the wire, before validation. Scalars may
/// be strings (multipart, urlencoded) or JSON numbers.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ProductFields {
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub stock: Option<String>,
}

/// A validated create request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub price: f64,
    pub category: String,
    pub stock: i32,
}

/// A validated partial update. `None` leaves the stored value untouched;
/// `description: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductChanges {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<Option<String>>,
    pub price: Option<f64>,
    pub category: Option<String>,
    pub stock: Option<i32>,
}

impl ProductFields {
    /// Assigns a text field by its form name. Unknown names are ignored.
    pub fn set(&mut self, field: &str, value: String) {
        let slot = match field {
            "name" => &mut self.name,
            "slug" => &mut self.slug,
            "description" => &mut self.description,
            "price" => &mut self.price,
            "category" => &mut self.category,
            "stock" => &mut self.stock,
            _ => return,
        };
        *slot = Some(value);
    }

    pub fn into_new_product(self) -> Result<NewProduct, AppError> {
        let (Some(name), Some(slug), Some(price), Some(category)) = (
            non_blank(self.name),
            non_blank(self.slug),
            non_blank(self.price),
            non_blank(self.category),
        ) else {
            return Err(AppError::validation(MISSING_FIELDS));
        };

        Ok(NewProduct {
            name,
            slug,
            description: non_blank(self.description),
            price: parse_price(&price)?,
            category,
            stock: parse_stock(self.stock.as_deref()),
        })
    }

    pub fn into_changes(self) -> Result<ProductChanges, AppError> {
        Ok(ProductChanges {
            name: required_if_present(self.name, "name")?,
            slug: required_if_present(self.slug, "slug")?,
            description: self.description.map(|d| non_blank(Some(d))),
            price: required_if_present(self.price, "price")?
                .map(|p| parse_price(&p))
                .transpose()?,
            category: required_if_present(self.category, "category")?,
            stock: self.stock.as_deref().map(|s| parse_stock(Some(s))),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_if_present(value: Option<String>, field: &str) -> Result<Option<String>, AppError> {
    match value {
        None => Ok(None),
        Some(v) => non_blank(Some(v))
            .map(Some)
            .ok_or_else(|| AppError::validation(format!("Field '{field}' cannot be empty"))),
    }
}

fn parse_price(raw: &str) -> Result<f64, AppError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && (0.0..=MAX_PRICE).contains(p))
        .ok_or_else(|| AppError::validation("Price must be a number between 0 and 99999999.99"))
}

/// Reads a leading integer the way form inputs are usually interpreted:
/// `"12abc"` is 12, `"7.9"` is 7, anything unreadable is 0.
fn parse_stock(raw: Option<&str>) -> i32 {
    let s = raw.map(str::trim).unwrap_or_default();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    match digits[..end].parse::<i32>() {
        Ok(n) if negative => -n,
        Ok(n) => n,
        Err(_) => 0,
    }
}

fn scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ScalarVisitor;

    impl<'de> Visitor<'de> for ScalarVisitor {
        type Value = Option<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string or a number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_owned()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
            d.deserialize_any(self)
        }
    }

    deserializer.deserialize_any(ScalarVisitor)
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(non_blank(Option::<String>::deserialize(deserializer)?))
}

fn blank_as_none_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match non_blank(Option::<String>::deserialize(deserializer)?) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected an integer, found {raw:?}"))),
        None => Ok(None),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListProductsQuery {
    #[serde(default, deserialize_with = "blank_as_none_i64")]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "blank_as_none_i64")]
    pub limit: Option<i64>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub search: Option<String>,
}

impl ListProductsQuery {
    /// Page is at least 1; limit falls back to the default below 1 and is
    /// capped at [`MAX_PAGE_LIMIT`].
    pub fn page_and_limit(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = match self.limit {
            Some(l) if l >= 1 => l.min(MAX_PAGE_LIMIT),
            _ => DEFAULT_PAGE_LIMIT,
        };
        (page, limit)
    }

    pub fn filter(&self) -> ProductFilter {
        ProductFilter {
            category: self.category.clone(),
            search: self.search.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductResponse {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub price: f64,
    pub category: String,
    pub stock: i32,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// Convert from Model to Response DTO
impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        Self {
            id: product.id,
            name: product.name,
            slug: product.slug,
            description: product.description,
            price: product.price,
            category: product.category,
            stock: product.stock,
            image_url: product.image_url,
            created_at: product.created_at,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl PaginationMeta {
    pub fn new(total: i64, page: i64, limit: i64) -> Self {
        Self {
            total,
            page,
            limit,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProductListResponse {
    pub data: Vec<ProductResponse>,
    pub pagination: PaginationMeta,
}

#[derive(Debug, Serialize)]
pub struct DeleteProductResponse {
    pub message: &'static str,
    pub id: i64,
}
