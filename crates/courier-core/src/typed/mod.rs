//! Typed - 型付き Task API
//!
//! Task 型と Handler を結びつけ、worker からは payload のバイト列と
//! `TaskContext` だけで呼び出せるようにします。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - JSON payload を型で扱う
//! - **内部（Dyn）**: `DynHandler` trait - registry に格納する object-safe な形
//! - **TaskContext**: retry 回数・deadline・キャンセル通知

pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::context::TaskContext;
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::registry::HandlerRegistry;
pub use self::task::Task;
