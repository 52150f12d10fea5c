//! Response rewrites, one variant per intercepted route.
//!
//! Every rule mutates a few known keys of the decoded body in place. A
//! missing key or a value of the wrong shape skips that mutation.

use serde_json::{Map, Value, json};

/// Platforms offered on every login channel.
pub const SELECT_PLATFORMS: [u8; 5] = [0, 1, 2, 3, 4];
/// `cv_review_status` value meaning approved.
pub const REVIEW_APPROVED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteRule {
    /// Enables platform selection and opens every channel to all platforms.
    LoginMethods,
    /// Attaches the PC extension info to the user record.
    UserRecord,
    /// Marks the client version as approved.
    ReviewConfig,
}

impl RewriteRule {
    pub fn apply(self, body: &mut Value) {
        let Some(root) = body.as_object_mut() else {
            return;
        };
        match self {
            RewriteRule::LoginMethods => login_methods(root),
            RewriteRule::UserRecord => user_record(root),
            RewriteRule::ReviewConfig => review_config(root),
        }
    }
}

fn login_methods(root: &mut Map<String, Value>) {
    root.insert("select_platform".into(), Value::Bool(true));
    root.insert("qrcode_select_platform".into(), Value::Bool(true));

    if let Some(config) = root.get_mut("config").and_then(Value::as_object_mut) {
        for entry in config.values_mut().filter_map(Value::as_object_mut) {
            entry.insert("select_platforms".into(), json!(SELECT_PLATFORMS));
        }
    }
}

fn user_record(root: &mut Map<String, Value>) {
    if let Some(user) = root.get_mut("user").and_then(Value::as_object_mut) {
        user.insert("pc_ext_info".into(), pc_ext_info());
    }
}

fn review_config(root: &mut Map<String, Value>) {
    let config = root
        .get_mut("game")
        .and_then(Value::as_object_mut)
        .and_then(|game| game.get_mut("config"))
        .and_then(Value::as_object_mut);
    if let Some(config) = config {
        config.insert("cv_review_status".into(), json!(REVIEW_APPROVED));
    }
}

pub fn pc_ext_info() -> Value {
    json!({
        "extra_unisdk_data": "",
        "from_game_id": "h55",
        "src_app_channel": "netease",
        "src_client_ip": "",
        "src_client_type": 1,
        "src_jf_game_id": "h55",
        "src_pay_channel": "netease",
        "src_sdk_version": "3.15.0",
        "src_udid": ""
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewritten(rule: RewriteRule, mut body: Value) -> Value {
        rule.apply(&mut body);
        body
    }

    #[test]
    fn login_methods_opens_every_channel() {
        let body = json!({
            "code": 0,
            "config": {
                "mobile": { "select_platforms": [2], "name": "mobile" },
                "email": { "enabled": true },
                "broken": "not an object"
            }
        });

        let out = rewritten(RewriteRule::LoginMethods, body);
        assert_eq!(out["select_platform"], json!(true));
        assert_eq!(out["qrcode_select_platform"], json!(true));
        assert_eq!(out["config"]["mobile"]["select_platforms"], json!([0, 1, 2, 3, 4]));
        assert_eq!(out["config"]["mobile"]["name"], json!("mobile"));
        assert_eq!(out["config"]["email"]["select_platforms"], json!([0, 1, 2, 3, 4]));
        assert_eq!(out["config"]["email"]["enabled"], json!(true));
        assert_eq!(out["config"]["broken"], json!("not an object"));
        assert_eq!(out["code"], json!(0));
        assert_eq!(out.as_object().unwrap().len(), 4);
    }

    #[test]
    fn login_methods_without_config_only_sets_flags() {
        let out = rewritten(RewriteRule::LoginMethods, json!({ "code": 0 }));
        assert_eq!(
            out,
            json!({ "code": 0, "select_platform": true, "qrcode_select_platform": true })
        );
    }

    #[test]
    fn user_record_injects_ext_info() {
        let out = rewritten(RewriteRule::UserRecord, json!({ "user": { "id": "u1" } }));
        assert_eq!(out["user"]["id"], json!("u1"));
        assert_eq!(out["user"]["pc_ext_info"], pc_ext_info());
    }

    #[test]
    fn user_record_without_user_is_untouched() {
        let body = json!({ "code": 1400, "reason": "expired" });
        assert_eq!(rewritten(RewriteRule::UserRecord, body.clone()), body);
    }

    #[test]
    fn review_config_approves() {
        let body = json!({ "game": { "config": { "cv_review_status": 0, "other": 7 } } });
        let out = rewritten(RewriteRule::ReviewConfig, body);
        assert_eq!(out["game"]["config"]["cv_review_status"], json!(1));
        assert_eq!(out["game"]["config"]["other"], json!(7));
    }

    #[test]
    fn review_config_tolerates_missing_nesting() {
        for body in [json!({}), json!({ "game": {} }), json!({ "game": 3 })] {
            assert_eq!(rewritten(RewriteRule::ReviewConfig, body.clone()), body);
        }
    }

    #[test]
    fn rules_are_idempotent_and_ignore_non_objects() {
        for rule in [RewriteRule::LoginMethods, RewriteRule::UserRecord, RewriteRule::ReviewConfig] {
            let body = json!({ "config": { "a": {} }, "user": {}, "game": { "config": {} } });
            let once = rewritten(rule, body);
            assert_eq!(rewritten(rule, once.clone()), once);

            assert_eq!(rewritten(rule, json!([1, 2])), json!([1, 2]));
            assert_eq!(rewritten(rule, Value::Null), Value::Null);
        }
    }
}
