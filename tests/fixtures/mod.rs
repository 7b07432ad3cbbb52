//! Documents used by the API and end-to-end tests.
#![allow(dead_code)]

/// A source document and what its conversion should look like.
#[derive(Debug, Clone)]
pub struct TestDocument {
    pub filename: &'static str,
    pub content_type: &'static str,
    pub body: &'static str,
    /// Filename the markdown result is offered under.
    pub expected_result: &'static str,
    /// Text the markdown must contain.
    pub expected_text: &'static str,
    pub description: &'static str,
}

/// Plain-text formats, so the fixtures convert with any engine (including a
/// `cat` stand-in) without binary files in the repository.
pub const TEST_DOCUMENTS: &[TestDocument] = &[
    TestDocument {
        filename: "meeting-notes.txt",
        content_type: "text/plain",
        body: "Meeting notes\n\n- budget approved\n- launch in May\n",
        expected_result: "meeting-notes.md",
        expected_text: "budget approved",
        description: "Plain text notes",
    },
    TestDocument {
        filename: "inventory.csv",
        content_type: "text/csv",
        body: "sku,name,qty\nA-1,widget,12\nB-2,gadget,3\n",
        expected_result: "inventory.md",
        expected_text: "widget",
        description: "Small CSV table",
    },
    TestDocument {
        filename: "Release Notes.html",
        content_type: "text/html",
        body: "<html><body><h1>Release 2.1</h1><p>Faster uploads.</p></body></html>",
        expected_result: "Release Notes.md",
        expected_text: "Release 2.1",
        description: "HTML page with a space in the filename",
    },
    TestDocument {
        filename: "settings.json",
        content_type: "application/json",
        body: "{\"theme\": \"dark\", \"retries\": 3}",
        expected_result: "settings.md",
        expected_text: "theme",
        description: "JSON document",
    },
];

pub fn document(filename: &str) -> &'static TestDocument {
    TEST_DOCUMENTS
        .iter()
        .find(|d| d.filename == filename)
        .unwrap_or_else(|| panic!("no fixture named {filename}"))
}
