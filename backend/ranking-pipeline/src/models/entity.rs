use super::identifier::{Identifier, SimpleIdentifierType};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Domain object that owns an identifier. Entities are read-only for the
/// lifetime of a request.
pub trait Entity: Send + Sync + fmt::Debug {
    fn identifier(&self) -> &Identifier;

    /// Entities nested inside this one (a product's brand, for example)
    fn nested_entities(&self) -> Vec<Arc<dyn Entity>> {
        Vec::new()
    }

    /// Runtime type tag used for component applicability checks
    fn entity_type(&self) -> Option<SimpleIdentifierType> {
        self.identifier().simple_type()
    }

    /// Downcasting hook for components that need concrete entity fields
    fn as_any(&self) -> &dyn Any;
}

/// Depth-first walk over `roots` and everything they nest. Parents come
/// before their children; repeated identifiers keep their first position.
pub fn collect_entity_graph(roots: &[Arc<dyn Entity>]) -> Vec<Arc<dyn Entity>> {
    fn visit(
        entity: &Arc<dyn Entity>,
        seen: &mut HashSet<Identifier>,
        out: &mut Vec<Arc<dyn Entity>>,
    ) {
        if !seen.insert(entity.identifier().clone()) {
            return;
        }
        out.push(Arc::clone(entity));
        for child in entity.nested_entities() {
            visit(&child, seen, out);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for root in roots {
        visit(root, &mut seen, &mut out);
    }
    out
}

// ============================================
// Built-in entities
// ============================================

#[derive(Debug, Clone)]
pub struct QueryEntity {
    identifier: Identifier,
    pub query: String,
}

impl QueryEntity {
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            identifier: Identifier::new(query.clone(), SimpleIdentifierType::Query),
            query,
        }
    }
}

impl Entity for QueryEntity {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct UserEntity {
    identifier: Identifier,
    pub user_id: String,
}

impl UserEntity {
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            identifier: Identifier::new(user_id.clone(), SimpleIdentifierType::User),
            user_id,
        }
    }
}

impl Entity for UserEntity {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct BrandEntity {
    identifier: Identifier,
    pub brand_id: String,
    pub name: Option<String>,
}

impl BrandEntity {
    pub fn new(brand_id: impl Into<String>) -> Self {
        let brand_id = brand_id.into();
        Self {
            identifier: Identifier::new(brand_id.clone(), SimpleIdentifierType::Brand),
            brand_id,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Entity for BrandEntity {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProductEntity {
    identifier: Identifier,
    pub product_id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub brand: Option<Arc<BrandEntity>>,
}

impl ProductEntity {
    pub fn new(product_id: impl Into<String>) -> Self {
        let product_id = product_id.into();
        Self {
            identifier: Identifier::new(product_id.clone(), SimpleIdentifierType::Product),
            product_id,
            title: None,
            price: None,
            brand: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_brand(mut self, brand: BrandEntity) -> Self {
        self.brand = Some(Arc::new(brand));
        self
    }
}

impl Entity for ProductEntity {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn nested_entities(&self) -> Vec<Arc<dyn Entity>> {
        self.brand
            .iter()
            .map(|brand| Arc::clone(brand) as Arc<dyn Entity>)
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
