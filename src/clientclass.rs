//! Named client classes: administrator-defined predicates over the content of
//! a client's DHCPv6 message, referenced by name from address classes'
//! allow/deny lists.

use std::sync::Arc;

use compact_str::CompactString;
use dhcproto::v6::{DhcpOption, Message, OptionCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{extensions::PolicyMessageExtV6, Duid};

/// Match expression evaluated against a client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassRule {
    /// Client Identifier starts with these bytes.
    ClientIdPrefix(Duid),
    /// Vendor Class option (16) from this enterprise, optionally with a data
    /// chunk containing the given text.
    VendorClass {
        enterprise: u32,
        #[serde(default)]
        contains: Option<CompactString>,
    },
    /// Some User Class option (15) chunk contains the given text.
    UserClass { contains: CompactString },
    /// The option with this code is present in the message.
    OptionPresent(u16),
    All(Vec<ClassRule>),
    Any(Vec<ClassRule>),
    Not(Box<ClassRule>),
}

impl ClassRule {
    pub fn is_satisfied_by(&self, msg: &Message) -> bool {
        match self {
            ClassRule::ClientIdPrefix(prefix) => msg
                .client_id()
                .is_some_and(|id| id.starts_with(&prefix.bytes)),
            ClassRule::VendorClass {
                enterprise,
                contains,
            } => msg.opts().iter().any(|opt| match opt {
                DhcpOption::VendorClass(vc) if vc.num == *enterprise => match contains {
                    Some(needle) => vc.data.iter().any(|chunk| find(chunk, needle.as_bytes())),
                    None => true,
                },
                _ => false,
            }),
            ClassRule::UserClass { contains } => msg.opts().iter().any(|opt| match opt {
                DhcpOption::UserClass(uc) => {
                    uc.data.iter().any(|chunk| find(chunk, contains.as_bytes()))
                }
                _ => false,
            }),
            ClassRule::OptionPresent(code) => msg
                .opts()
                .iter()
                .any(|opt| u16::from(OptionCode::from(opt)) == *code),
            ClassRule::All(rules) => rules.iter().all(|r| r.is_satisfied_by(msg)),
            ClassRule::Any(rules) => rules.iter().any(|r| r.is_satisfied_by(msg)),
            ClassRule::Not(rule) => !rule.is_satisfied_by(msg),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientClass {
    pub name: CompactString,
    pub rule: ClassRule,
}

impl ClientClass {
    pub fn is_satisfied_by(&self, msg: &Message) -> bool {
        let hit = self.rule.is_satisfied_by(msg);
        debug!(client_class = %self.name, hit, "client class test");
        hit
    }
}

/// Global table of named client classes, shared by every address class.
#[derive(Debug, Default)]
pub struct ClientClassTable {
    classes: Vec<Arc<ClientClass>>,
}

impl ClientClassTable {
    pub fn new(classes: Vec<ClientClass>) -> Self {
        let classes: Vec<Arc<ClientClass>> = classes.into_iter().map(Arc::new).collect();
        for (i, class) in classes.iter().enumerate() {
            if classes[..i].iter().any(|c| c.name == class.name) {
                warn!(client_class = %class.name, "client class defined more than once, every definition is used");
            }
        }
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Map class names to their predicates. Unknown names are dropped with a
    /// warning.
    pub fn resolve(&self, names: &[CompactString]) -> Vec<Arc<ClientClass>> {
        let mut resolved = Vec::new();
        for name in names {
            let before = resolved.len();
            resolved.extend(
                self.classes
                    .iter()
                    .filter(|c| &c.name == name)
                    .map(Arc::clone),
            );
            if resolved.len() == before {
                warn!(client_class = %name, "unknown client class name, ignoring");
            } else {
                debug!(client_class = %name, "resolved client class");
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhcproto::v6::{MessageType, UserClass, VendorClass};

    fn solicit(opts: Vec<DhcpOption>) -> Message {
        let mut msg = Message::new(MessageType::Solicit);
        for opt in opts {
            msg.opts_mut().insert(opt);
        }
        msg
    }

    fn phone() -> Message {
        solicit(vec![
            DhcpOption::ClientId(vec![0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb]),
            DhcpOption::VendorClass(VendorClass {
                num: 5678,
                data: vec![b"acme-phone-x200".to_vec()],
            }),
        ])
    }

    #[test]
    fn vendor_class_rules() {
        let enterprise_only = ClassRule::VendorClass {
            enterprise: 5678,
            contains: None,
        };
        let with_text = ClassRule::VendorClass {
            enterprise: 5678,
            contains: Some("phone".into()),
        };
        let other_text = ClassRule::VendorClass {
            enterprise: 5678,
            contains: Some("laptop".into()),
        };
        let other_vendor = ClassRule::VendorClass {
            enterprise: 1,
            contains: None,
        };
        let msg = phone();
        assert!(enterprise_only.is_satisfied_by(&msg));
        assert!(with_text.is_satisfied_by(&msg));
        assert!(!other_text.is_satisfied_by(&msg));
        assert!(!other_vendor.is_satisfied_by(&msg));
    }

    #[test]
    fn user_class_and_client_id() {
        let msg = solicit(vec![
            DhcpOption::ClientId(vec![0x00, 0x01, 0x02]),
            DhcpOption::UserClass(UserClass {
                data: vec![b"lab".to_vec(), b"printers".to_vec()],
            }),
        ]);
        assert!(ClassRule::UserClass {
            contains: "print".into()
        }
        .is_satisfied_by(&msg));
        assert!(ClassRule::ClientIdPrefix(Duid::from(vec![0x00, 0x01])).is_satisfied_by(&msg));
        assert!(!ClassRule::ClientIdPrefix(Duid::from(vec![0x00, 0x03])).is_satisfied_by(&msg));
    }

    #[test]
    fn option_present_and_combinators() {
        let msg = phone();
        let has_vendor = ClassRule::OptionPresent(16);
        let has_rapid = ClassRule::OptionPresent(14);
        assert!(has_vendor.is_satisfied_by(&msg));
        assert!(!has_rapid.is_satisfied_by(&msg));
        assert!(!ClassRule::All(vec![has_vendor.clone(), has_rapid.clone()]).is_satisfied_by(&msg));
        assert!(ClassRule::Any(vec![has_vendor.clone(), has_rapid.clone()]).is_satisfied_by(&msg));
        assert!(ClassRule::Not(Box::new(has_rapid)).is_satisfied_by(&msg));
    }

    #[test]
    fn resolve_drops_unknown_names() {
        let table = ClientClassTable::new(vec![
            ClientClass {
                name: "phones".into(),
                rule: ClassRule::OptionPresent(16),
            },
            ClientClass {
                name: "printers".into(),
                rule: ClassRule::OptionPresent(15),
            },
        ]);
        let resolved = table.resolve(&["phones".into(), "toasters".into()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "phones");
    }

    #[test]
    fn deserialize_rules() {
        let json = r#"{
            "name": "phones",
            "rule": {"all": [
                {"vendor_class": {"enterprise": 5678, "contains": "phone"}},
                {"not": {"client_id_prefix": "00:01"}}
            ]}
        }"#;
        let class: ClientClass = serde_json::from_str(json).unwrap();
        assert!(class.is_satisfied_by(&phone()));
    }
}
