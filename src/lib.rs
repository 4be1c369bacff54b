//! # Collection Sync
//!
//! A cross-store consistency engine for document collections whose
//! searchable form lives in two independent stores.
//!
//! A **metadata store** is the source of truth for identity, configuration
//! and statistics of collections, documents and chunks. A **vector index**
//! holds one named container of embeddings per collection. Nothing makes
//! writes to the two atomic, so this crate tracks the sync state of every
//! record, repairs divergence in the background, and reports on both.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────────┐
//!  intent ──▶│ SyncCoordinator│──▶ lifecycle (validate)
//!            └──┬──────────┬──┘
//!               │          │
//!               ▼          ▼
//!        ┌──────────┐  ┌──────────┐
//!        │ Metadata │  │  Vector  │
//!        │  Store   │  │  Index   │
//!        └──────────┘  └──────────┘
//!               ▲          ▲
//!            ┌──┴──────────┴──┐      ┌──────────────────┐
//!            │ Reconciliation │      │ HealthAggregator │
//!            │    Scanner     │      └──────────────────┘
//!            └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csync init                       # create both databases
//! csync create "Research Notes"    # record + vector container
//! csync health                     # system-wide status
//! csync reconcile --watch          # periodic repair sweep
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Collection, Document, Chunk records and request/result types |
//! | [`error`] | `SyncError` taxonomy |
//! | [`lifecycle`] | Status transition tables |
//! | [`locks`] | Per-collection single-flight table |
//! | [`store`] | Metadata store trait and implementations |
//! | [`vector`] | Vector index trait and implementations |
//! | [`coordinator`] | Create / sync / delete of collections |
//! | [`reconcile`] | Divergence sweep |
//! | [`health`] | Per-collection and system health |
//! | [`stats`] | Collection statistics |
//! | [`engine`] | Component wiring |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod locks;
pub mod migrate;
pub mod models;
pub mod reconcile;
pub mod stats;
pub mod store;
pub mod vector;
