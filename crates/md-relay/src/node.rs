use crate::{Error, Result};
use std::collections::BTreeMap;

/// Payload of a [`BinaryNode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeContent {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Nodes(Vec<BinaryNode>),
}

/// In-memory form of a wire stanza: a tag, string attributes and either raw
/// bytes or child nodes. Byte-level encoding belongs to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryNode {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub content: NodeContent,
}

impl BinaryNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    pub fn with_children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn push_child(&mut self, child: BinaryNode) {
        match &mut self.content {
            NodeContent::Nodes(children) => children.push(child),
            _ => self.content = NodeContent::Nodes(vec![child]),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn require_attr(&self, key: &str) -> Result<&str> {
        self.attr(key)
            .ok_or_else(|| Error::Protocol(format!("<{}> missing attribute {key}", self.tag)))
    }

    pub fn child_nodes(&self) -> &[BinaryNode] {
        match &self.content {
            NodeContent::Nodes(children) => children,
            _ => &[],
        }
    }

    pub fn child(&self, tag: &str) -> Option<&BinaryNode> {
        self.child_nodes().iter().find(|c| c.tag == tag)
    }

    pub fn require_child(&self, tag: &str) -> Result<&BinaryNode> {
        self.child(tag).ok_or_else(|| Error::UnexpectedNode {
            expected: tag.to_string(),
            got: format!("{} without it", self.tag),
        })
    }

    pub fn children_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a BinaryNode> {
        self.child_nodes().iter().filter(move |c| c.tag == tag)
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn child_bytes(&self, tag: &str) -> Option<&[u8]> {
        self.child(tag).and_then(BinaryNode::content_bytes)
    }

    /// Big-endian unsigned integer stored as the byte content of a child.
    pub fn child_uint(&self, tag: &str, len: usize) -> Result<u32> {
        let bytes = self
            .child_bytes(tag)
            .ok_or_else(|| Error::Protocol(format!("<{}> missing <{tag}>", self.tag)))?;
        if bytes.len() != len || len > 4 {
            return Err(Error::Protocol(format!(
                "<{tag}> expected {len} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    /// Fails with [`Error::ServerError`] when the node carries an `<error>`.
    pub fn assert_error_free(&self) -> Result<()> {
        if let Some(error) = self.child("error") {
            return Err(Error::ServerError {
                code: error.attr("code").unwrap_or("unknown").to_string(),
                context: format!("<{}> {}", self.tag, error.attr("text").unwrap_or_default()),
            });
        }
        Ok(())
    }

    /// Depth-first search for every descendant (including self) with `tag`.
    pub fn find_all(&self, tag: &str) -> Vec<&BinaryNode> {
        let mut out = Vec::new();
        self.collect(tag, &mut out);
        out
    }

    fn collect<'a>(&'a self, tag: &str, out: &mut Vec<&'a BinaryNode>) {
        if self.tag == tag {
            out.push(self);
        }
        for child in self.child_nodes() {
            child.collect(tag, out);
        }
    }
}

pub(crate) fn uint_bytes(value: u32, len: usize) -> Vec<u8> {
    value.to_be_bytes()[4 - len.min(4)..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_children_and_uints() {
        let node = BinaryNode::new("user")
            .with_attr("jid", "1@s.whatsapp.net")
            .with_children(vec![
                BinaryNode::new("registration").with_bytes(uint_bytes(0x01020304, 4)),
                BinaryNode::new("skey").with_children(vec![
                    BinaryNode::new("id").with_bytes(uint_bytes(513, 3))
                ]),
            ]);

        assert_eq!(node.child_uint("registration", 4).unwrap(), 0x01020304);
        assert_eq!(node.require_child("skey").unwrap().child_uint("id", 3).unwrap(), 513);
        assert!(node.child_uint("registration", 3).is_err());
        assert_eq!(node.find_all("id").len(), 1);
    }

    #[test]
    fn error_child_becomes_server_error() {
        let node = BinaryNode::new("user").with_children(vec![BinaryNode::new("error")
            .with_attr("code", "404")
            .with_attr("text", "item-not-found")]);
        match node.assert_error_free() {
            Err(Error::ServerError { code, .. }) => assert_eq!(code, "404"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn push_child_converts_empty_content() {
        let mut node = BinaryNode::new("message");
        node.push_child(BinaryNode::new("enc"));
        node.push_child(BinaryNode::new("device-identity"));
        assert_eq!(node.child_nodes().len(), 2);
    }
}
