use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sample User entity for testing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

impl User {
    pub fn new(username: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
        }
    }

    /// Key under which the user is kept in `MemoryStorage`.
    pub fn key(&self) -> String {
        format!("user:{}", self.id)
    }
}

/// Sample Order entity for testing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_name: String,
    pub amount: i64,
}

impl Order {
    pub fn new(user_id: Uuid, product_name: &str, amount: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            product_name: product_name.to_string(),
            amount,
        }
    }

    pub fn key(&self) -> String {
        format!("order:{}", self.id)
    }
}
