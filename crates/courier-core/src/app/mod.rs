//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Distributor**: タスクの投入口
//! - **ProcessorBuilder**: Processor の構築とワイヤリング
//! - **Processor**: worker pool + reaper のライフサイクル
//! - **WorkerLoop**: タスク実行ループ（claim→handle→ack/retry/dead）
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **status**: キュー件数の集計とタスク状態の説明

pub mod builder;
pub mod distributor;
pub mod processor;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, ProcessorBuilder};
pub use self::distributor::Distributor;
pub use self::processor::Processor;
pub use self::reaper_loop::ReaperLoop;
pub use self::status::{QueueStatus, StatusReport, describe, status_report};
pub use self::worker_loop::WorkerLoop;
