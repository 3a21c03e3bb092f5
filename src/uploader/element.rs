// 上传目标
//
// 目标由数据集 ID 与组件名唯一确定，每次远端调用都要带上这组键

use serde_json::{Map, Value};
use std::fmt;

/// 单次上传相关路由
pub const INIT_UPLOAD_ROUTE: &str = "init-upload-component";
pub const COMPLETE_UPLOAD_ROUTE: &str = "complete-upload-component";
/// legacy 单次上传路由
pub const LEGACY_UPLOAD_ROUTE: &str = "upload-component";

/// 分片上传相关路由
pub const CREATE_MULTIPART_ROUTE: &str = "create-multipart-upload";
pub const GET_PART_ROUTE: &str = "get-upload-part-url";
pub const LEGACY_UPLOAD_PART_ROUTE: &str = "upload-part";
pub const COMPLETE_MULTIPART_ROUTE: &str = "complete-multipart-upload";

/// 数据集组件上传目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationKey {
    /// 数据集 ID
    pub dataset: String,
    /// 组件名
    pub component: String,
}

impl DestinationKey {
    pub fn new(dataset: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            component: component.into(),
        }
    }

    /// 请求体中的键值
    pub fn value(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("dataset".to_string(), Value::from(self.dataset.as_str()));
        map.insert("component".to_string(), Value::from(self.component.as_str()));
        map
    }

    /// 查询字符串形式的键值
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("dataset", self.dataset.clone()),
            ("component", self.component.clone()),
        ]
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dataset={}, component={}", self.dataset, self.component)
    }
}

/// 拼接查询字符串
pub fn encode_query(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
