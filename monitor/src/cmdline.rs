//! Builds the unikernel boot command line: a JSON document the
//! monitor passes straight through to the rumprun-based unikernel,
//! whose JSON parser expects a bare string for `cmdline`, a nested
//! object for `net`/`blk`, and -- unusually -- one duplicate top-level
//! `env` key per environment variable rather than an array. Mirrors
//! the original implementation's hand-rolled `rumpArgs.MarshalJSON`.

use serde::Serialize;
use serde_json::json;

#[derive(Serialize, Clone)]
pub struct Network {
    #[serde(rename = "if")]
    pub interface: String,
    pub cloner: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub method: String,
    pub addr: String,
    pub mask: String,
    pub gw: String,
}

impl Network {
    /// Static IPv4 config for the container's single tap interface,
    /// the only network shape this runtime ever hands a unikernel.
    pub fn static_v4(addr: &str, mask: &str, gw: &str) -> Self {
        Self {
            interface: "ukvmif0".into(),
            cloner: "True".into(),
            kind: "inet".into(),
            method: "static".into(),
            addr: addr.into(),
            mask: mask.into(),
            gw: gw.into(),
        }
    }
}

#[derive(Serialize, Clone)]
pub struct Block {
    pub source: String,
    pub path: String,
    pub fstype: String,
    pub mountpoint: String,
}

impl Block {
    /// The rootfs ISO is always attached as the first etfs disk at a
    /// fixed guest path, matching the device the original
    /// implementation's rump kernel build wires up.
    pub fn rootfs(mount_point: &str) -> Self {
        Self {
            source: "etfs".into(),
            path: "/dev/ld0a".into(),
            fstype: "blk".into(),
            mountpoint: mount_point.into(),
        }
    }
}

pub struct RumpArgs {
    pub cwd: String,
    pub cmdline: String,
    pub net: Network,
    pub blk: Option<Block>,
    pub env: Vec<String>,
    pub mem: Option<String>,
}

#[derive(Serialize)]
struct Alias {
    cmdline: String,
    net: Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    blk: Option<Block>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mem: Option<String>,
}

impl RumpArgs {
    /// Serializes to the exact duplicate-`env`-key document the
    /// unikernel's JSON parser requires: every other field goes
    /// through ordinary `serde_json`, then one `"env":"..."` pair per
    /// environment variable is spliced in right after the opening
    /// brace, byte for byte the way the original `MarshalJSON` does.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let alias = Alias {
            cmdline: self.cmdline.clone(),
            net: self.net.clone(),
            blk: self.blk.clone(),
            cwd: if self.cwd.is_empty() { None } else { Some(self.cwd.clone()) },
            mem: self.mem.clone(),
        };

        let body = serde_json::to_string(&alias)?;

        let mut prefix = String::new();
        for value in &self.env {
            let pair = serde_json::to_string(&json!({ "env": value }))?;
            // `pair` is `{"env":"value"}`; keep the inner `"env":"value"`
            // and drop the braces so it can be spliced between the
            // real object's opening brace and its first real field.
            prefix.push_str(&pair[1..pair.len() - 1]);
            prefix.push(',');
        }

        let mut result = String::with_capacity(body.len() + prefix.len());
        result.push_str(&body[..1]);
        result.push_str(&prefix);
        result.push_str(&body[1..]);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_env_produces_ordinary_object() {
        let args = RumpArgs {
            cwd: "/".into(),
            cmdline: "unikernel.nabla".into(),
            net: Network::static_v4("10.0.0.2", "24", "10.0.0.1"),
            blk: None,
            env: vec![],
            mem: Some("512".into()),
        };

        let json = args.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["cmdline"], "unikernel.nabla");
        assert_eq!(parsed["net"]["addr"], "10.0.0.2");
        assert!(parsed.get("blk").is_none());
    }

    #[test]
    fn test_env_vars_are_duplicated_top_level_keys() {
        let args = RumpArgs {
            cwd: "/".into(),
            cmdline: "unikernel.nabla".into(),
            net: Network::static_v4("10.0.0.2", "24", "10.0.0.1"),
            blk: Some(Block::rootfs("/")),
            env: vec!["FOO=bar".into(), "BAZ=qux".into()],
            mem: None,
        };

        let json = args.to_json().unwrap();

        // Not valid as a parsed-into-map object (duplicate keys), but
        // it must scan as two literal `"env":"..."` occurrences -- a
        // regular `serde_json::Value` map would collapse them.
        assert_eq!(json.matches("\"env\":").count(), 2);
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
        assert!(json.contains("\"env\":\"FOO=bar\""));
        assert!(json.contains("\"env\":\"BAZ=qux\""));
    }
}
