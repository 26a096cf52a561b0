//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskType;

/// Task は task_type と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendVerifyEmail {
///     username: String,
/// }
///
/// impl Task for SendVerifyEmail {
///     const TYPE: &'static str = "email:verify";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: Distributor が payload (JSON) を作るため
/// - `DeserializeOwned`: Worker が payload から復元するため
/// - `Send + Sync + 'static`: spawn された handler task に move するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - `{domain}:{action}`
    /// - 例: `email:verify`
    const TYPE: &'static str;

    fn task_type() -> TaskType {
        TaskType::new(Self::TYPE)
    }
}
