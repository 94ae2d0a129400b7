//! 工具参数 JSON Schema 生成（schemars 自动生成）
//!
//! 参数类型派生 JsonSchema，schema 与实际反序列化规则一致，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 返回参数类型的 JSON Schema（去掉 `$schema` 与 `title`，供 function tools 使用）
pub fn params_schema<P: JsonSchema>() -> Value {
    let schema = schema_for!(P);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}
