use super::*;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn kind_from_extension() {
    assert_eq!(
        DocumentKind::from_path(&PathBuf::from("notes.MD")),
        DocumentKind::Markdown
    );
    assert_eq!(
        DocumentKind::from_path(&PathBuf::from("page.htm")),
        DocumentKind::Html
    );
    assert_eq!(
        DocumentKind::from_path(&PathBuf::from("policy.txt")),
        DocumentKind::PlainText
    );
    assert_eq!(
        DocumentKind::from_path(&PathBuf::from("README")),
        DocumentKind::PlainText
    );
    assert_eq!(DocumentKind::Markdown.as_str(), "md");
}

#[test]
fn plain_text_is_whitespace_normalised() {
    let extracted = extract_text("  Line   one \n\n\n\nLine two\t\tend  ", DocumentKind::PlainText)
        .expect("should extract");
    assert_eq!(extracted.text, "Line one\n\nLine two end");
    assert_eq!(extracted.title, None);
}

#[test]
fn markdown_markup_is_stripped() {
    let markdown = "# Attendance Policy\n\nStudents **must** attend.\n\n- First item\n- Second `code`\n\n```\nlet x = 1;\n```\n";
    let extracted = extract_text(markdown, DocumentKind::Markdown).expect("should extract");

    assert_eq!(extracted.title.as_deref(), Some("Attendance Policy"));
    assert!(extracted.text.starts_with("Attendance Policy"));
    assert!(extracted.text.contains("Students must attend."));
    assert!(extracted.text.contains("- First item"));
    assert!(extracted.text.contains("- Second code"));
    assert!(extracted.text.contains("let x = 1;"));
    assert!(!extracted.text.contains("**"));
    assert!(!extracted.text.contains("```"));
}

#[test]
fn html_keeps_main_content_only() {
    let html = r#"
        <html>
          <head><title>Term Dates</title><style>body { color: red; }</style></head>
          <body>
            <nav>Home | About</nav>
            <main>
              <h1>Autumn term</h1>
              <p>Starts on   <b>4 September</b>.</p>
              <script>alert('x')</script>
              <ul><li>Half term: October</li><li>Ends: December</li></ul>
            </main>
            <footer>Copyright</footer>
          </body>
        </html>
    "#;
    let extracted = extract_text(html, DocumentKind::Html).expect("should extract");

    assert_eq!(extracted.title.as_deref(), Some("Term Dates"));
    assert!(extracted.text.contains("Autumn term"));
    assert!(extracted.text.contains("Starts on 4 September."));
    assert!(extracted.text.contains("Half term: October\n"));
    assert!(!extracted.text.contains("alert"));
    assert!(!extracted.text.contains("Home | About"));
    assert!(!extracted.text.contains("Copyright"));
    assert!(!extracted.text.contains("color: red"));
}

#[test]
fn html_title_falls_back_to_heading() {
    let extracted = extract_text(
        "<html><body><h1>Uniform</h1><p>Blazers required.</p></body></html>",
        DocumentKind::Html,
    )
    .expect("should extract");
    assert_eq!(extracted.title.as_deref(), Some("Uniform"));
    assert_eq!(extracted.text, "Uniform\n\nBlazers required.");
}

#[tokio::test]
async fn extract_file_reads_by_extension() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let path = temp_dir.path().join("guide.md");
    std::fs::write(&path, "## Lunch\n\nServed at noon.").expect("should write");

    let extracted = extract_file(&path).await.expect("should extract");
    assert_eq!(extracted.kind, DocumentKind::Markdown);
    assert_eq!(extracted.title.as_deref(), Some("Lunch"));
    assert_eq!(extracted.text, "Lunch\n\nServed at noon.");
}

#[tokio::test]
async fn extract_file_rejects_binary() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let path = temp_dir.path().join("blob.txt");
    std::fs::write(&path, [0xff, 0xfe, 0x00]).expect("should write");

    assert!(matches!(
        extract_file(&path).await,
        Err(KbError::Validation(_))
    ));
}

#[tokio::test]
async fn extract_file_missing_is_io_error() {
    let result = extract_file(Path::new("/definitely/not/here.txt")).await;
    assert!(matches!(result, Err(KbError::Io(_))));
}
