//! Persistence layer: a generic repository per entity and the domain
//! repositories built on top of it.

pub mod base;
pub mod entity;
pub mod query;
pub mod subscription;
pub mod user;

pub use base::BaseRepository;
pub use entity::Entity;
pub use query::{
    Fields, Filter, FilterGroup, FilterNode, FilterOperator, LogicalOperator, Page, Pagination,
    QueryOptions, SortBy, SortDirection, SqlValue, MAX_PAGE_SIZE,
};
pub use subscription::{PgSubscriptionRepository, SubscriptionRepository, PROMO_CODE_METADATA_KEY};
pub use user::{PgUserRepository, UserRepository};
