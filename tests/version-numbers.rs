#[test]
fn test_readme_deps() {
    version_sync::assert_markdown_deps_updated!("README.md");
}

#[test]
fn test_crate_docs_deps() {
    version_sync::assert_contains_regex!("src/lib.rs", "^//! dvbsi-io = \"~{version}\"$");
}
