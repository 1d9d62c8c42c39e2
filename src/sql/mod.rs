//! SQL utilities for dynamic tables
//!
//! Identifier sanitization, filter/sort fragments, DDL generation and the
//! query, view and listing builders.

pub mod ddl;
pub mod filter;
pub mod locale;
pub mod query;
pub mod sanitize;
pub mod view;

pub use ddl::DdlGenerator;
pub use filter::{Filter, FilterCondition, FilterOperator, Sort, SortDirection};
pub use locale::{ListOptions, LocaleQueryService, PageInfo, collation_for_locale};
pub use query::{QueryBuilder, SelectOptions, SqlStatement};
pub use sanitize::{
    RESERVED_KEYWORDS, build_schema_name, build_table_name, build_view_name, escape_identifier,
    unquote_identifier, validate_identifier,
};
pub use view::{
    Aggregate, CustomViewOptions, MaterializedColumn, MaterializedViewOptions, ViewBuilder,
    ViewColumn,
};
