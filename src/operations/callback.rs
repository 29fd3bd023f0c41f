//! 按钮回调数据解析：`confirm_<id>` / `cancel_<id>` / `custom_button_<action>`

pub const CONFIRM_PREFIX: &str = "confirm_";
pub const CANCEL_PREFIX: &str = "cancel_";
pub const CUSTOM_BUTTON_PREFIX: &str = "custom_button_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Confirm(String),
    Cancel(String),
    /// 脚本通过 sendMessageWithButtons 发出的自定义按钮
    CustomButton(String),
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let data = data.trim();
        if let Some(action) = data.strip_prefix(CUSTOM_BUTTON_PREFIX) {
            return non_empty(action).map(CallbackAction::CustomButton);
        }
        if let Some(id) = data.strip_prefix(CONFIRM_PREFIX) {
            return non_empty(id).map(CallbackAction::Confirm);
        }
        if let Some(id) = data.strip_prefix(CANCEL_PREFIX) {
            return non_empty(id).map(CallbackAction::Cancel);
        }
        None
    }

    pub fn confirm_data(op_id: &str) -> String {
        format!("{CONFIRM_PREFIX}{op_id}")
    }

    pub fn cancel_data(op_id: &str) -> String {
        format!("{CANCEL_PREFIX}{op_id}")
    }

    pub fn custom_data(action: &str) -> String {
        format!("{CUSTOM_BUTTON_PREFIX}{action}")
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
