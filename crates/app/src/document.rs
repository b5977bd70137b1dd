//! Document classification and the deduplicated document sets threads carry.

use std::collections::HashSet;

pub use arbor_llm::is_document_mime;

use crate::message::{Attachment, Message};

/// Identity used for deduplication. Content is not hashed, so two different files
/// with the same name and type collapse into one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub name: String,
    pub mime_type: String,
}

impl DocumentKey {
    pub fn of(attachment: &Attachment) -> Self {
        Self {
            name: attachment.name.clone(),
            mime_type: attachment.mime_type.clone(),
        }
    }
}

/// Insertion-ordered set of documents keyed by `(name, mime_type)`.
/// First writer wins; later duplicates are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSet {
    documents: Vec<Attachment>,
    keys: HashSet<DocumentKey>,
}

impl DocumentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document-classified attachment. Returns false for duplicates and
    /// for attachments that are not documents.
    pub fn insert(&mut self, attachment: &Attachment) -> bool {
        if !is_document_mime(&attachment.mime_type) {
            return false;
        }

        if !self.keys.insert(DocumentKey::of(attachment)) {
            return false;
        }
        self.documents.push(attachment.clone());
        true
    }

    pub fn extend_from<'a>(
        &mut self,
        attachments: impl IntoIterator<Item = &'a Attachment>,
    ) -> usize {
        attachments
            .into_iter()
            .filter(|attachment| self.insert(attachment))
            .count()
    }

    pub fn merge(&mut self, other: &DocumentSet) -> usize {
        self.extend_from(other.iter())
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.keys.contains(key)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.documents.iter().any(|document| document.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.documents.iter()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn from_history(history: &[Message]) -> Self {
        let mut set = Self::new();
        for message in history {
            set.extend_from(&message.attachments);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_documents_by_mime_type() {
        assert!(is_document_mime("application/pdf"));
        assert!(is_document_mime("text/plain"));
        assert!(is_document_mime("Text/Markdown"));
        assert!(is_document_mime("application/x-python"));
        assert!(!is_document_mime("image/png"));
        assert!(!is_document_mime("audio/wav"));
        assert!(!is_document_mime("application/octet-stream"));
    }

    #[test]
    fn same_name_and_type_collapse_to_one_entry() {
        let mut set = DocumentSet::new();
        assert!(set.insert(&Attachment::new("notes.txt", "text/plain", "Zmlyc3Q=")));
        assert!(!set.insert(&Attachment::new("notes.txt", "text/plain", "c2Vjb25k")));
        assert_eq!(set.len(), 1);
        // First writer wins.
        assert_eq!(set.iter().next().unwrap().payload, "Zmlyc3Q=");
    }

    #[test]
    fn same_name_with_a_different_type_is_distinct() {
        let mut set = DocumentSet::new();
        set.insert(&Attachment::new("notes", "text/plain", ""));
        set.insert(&Attachment::new("notes", "text/markdown", ""));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn history_extraction_skips_media() {
        let history = vec![
            Message::user(
                "look",
                vec![
                    Attachment::new("cat.png", "image/png", ""),
                    Attachment::new("report.pdf", "application/pdf", ""),
                ],
            ),
            Message::model("ok", None),
        ];

        let set = DocumentSet::from_history(&history);
        assert_eq!(set.len(), 1);
        assert!(set.contains_name("report.pdf"));
    }
}
