//! Entity types and job priorities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReindexError;

/// Catalog entity kinds that can be reindexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Product,
    Category,
    CategoryProducts,
    Attribute,
    TaxRule,
    Page,
    Block,
    Stock,
    Review,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Product,
        EntityType::Category,
        EntityType::CategoryProducts,
        EntityType::Attribute,
        EntityType::TaxRule,
        EntityType::Page,
        EntityType::Block,
        EntityType::Stock,
        EntityType::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Category => "category",
            EntityType::CategoryProducts => "category_products",
            EntityType::Attribute => "attribute",
            EntityType::TaxRule => "tax_rule",
            EntityType::Page => "page",
            EntityType::Block => "block",
            EntityType::Stock => "stock",
            EntityType::Review => "review",
        }
    }

    /// Entities that cannot be reindexed without an explicit id list
    ///
    /// A full stock refresh is a product reindex.
    pub fn requires_ids(&self) -> bool {
        matches!(self, EntityType::Stock)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ReindexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" => Ok(EntityType::Product),
            "category" => Ok(EntityType::Category),
            "category_products" | "categoryproducts" => Ok(EntityType::CategoryProducts),
            "attribute" => Ok(EntityType::Attribute),
            "tax_rule" | "taxrule" => Ok(EntityType::TaxRule),
            "page" | "cms_page" => Ok(EntityType::Page),
            "block" | "cms_block" => Ok(EntityType::Block),
            "stock" => Ok(EntityType::Stock),
            "review" => Ok(EntityType::Review),
            _ => Err(ReindexError::UnknownEntity(s.to_string())),
        }
    }
}

/// Broker job priority; lower weight is claimed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn weight(&self) -> i64 {
        match self {
            Priority::Low => 10,
            Priority::Normal => 0,
            Priority::Medium => -5,
            Priority::High => -10,
            Priority::Critical => -15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ReindexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(ReindexError::UnknownPriority(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_round_trips_through_str() {
        for entity in EntityType::ALL {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
    }

    #[test]
    fn test_entity_aliases() {
        assert_eq!("taxrule".parse::<EntityType>().unwrap(), EntityType::TaxRule);
        assert_eq!(" Product ".parse::<EntityType>().unwrap(), EntityType::Product);
        assert!(matches!(
            "widget".parse::<EntityType>(),
            Err(ReindexError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_only_stock_requires_ids() {
        let requiring: Vec<_> = EntityType::ALL.iter().filter(|e| e.requires_ids()).collect();
        assert_eq!(requiring, vec![&EntityType::Stock]);
    }

    #[test]
    fn test_priority_weights_sort_critical_first() {
        let mut priorities = vec![
            Priority::Low,
            Priority::Critical,
            Priority::Normal,
            Priority::High,
            Priority::Medium,
        ];
        priorities.sort_by_key(|p| p.weight());
        assert_eq!(
            priorities,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Normal,
                Priority::Low
            ]
        );
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_unknown_priority_rejected() {
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(ReindexError::UnknownPriority(_))
        ));
    }
}
