//! Unit tests for source routing, URL translation and the HTTP flows.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rstest::{fixture, rstest};
use serde_json::json;
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use super::dispatch::{Route, route};
use super::*;
use crate::cancel::CancellationSampler;

fn token(value: &str) -> HttpAuth {
    HttpAuth::new(None, None, Some(value.to_owned()))
}

fn encoded(text: &str) -> String {
    STANDARD.encode(text)
}

/// Serves `response` after cancelling `cancel`, so the caller observes the
/// cancellation only once the reply is in hand.
struct CancelWhenServed {
    cancel: CancellationSampler,
    response: ResponseTemplate,
}

impl Respond for CancelWhenServed {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.cancel.cancel();
        self.response.clone()
    }
}

#[fixture]
fn config() -> DownloadConfig {
    DownloadConfig {
        http_timeout_secs: 5,
        ..DownloadConfig::default()
    }
}

#[rstest]
#[case("some_file.ps1", true)]
#[case("folder1/some_file.ps1", true)]
#[case("folder1/Run.SH", true)]
#[case("", false)]
#[case("folder1/folder2", false)]
#[case("folder1/.sh", false)]
fn path_to_file_detection(#[case] candidate: &str, #[case] expected: bool) {
    assert_eq!(is_path_to_file(candidate), expected);
}

#[test]
fn blank_credentials_are_anonymous() {
    let auth = HttpAuth::new(Some(String::from(" ")), Some(String::new()), None);
    assert!(auth.is_anonymous());
    assert_eq!(authentication_plan("https://example.com/a.sh", &auth), vec![AuthStrategy::Anonymous]);
}

#[test]
fn debug_output_redacts_secrets() {
    let auth = HttpAuth::new(
        Some(String::from("alice")),
        Some(String::from("hunter2")),
        Some(String::from("glpat-123")),
    );
    let rendered = format!("{auth:?}");
    assert!(rendered.contains("alice"));
    assert!(!rendered.contains("hunter2"));
    assert!(!rendered.contains("glpat-123"));
}

#[test]
fn token_plan_probes_gitlab_before_bearer() {
    let plan = authentication_plan("http://10.0.0.5/root/tools/-/raw/main/run.sh", &token("t"));
    let labels: Vec<_> = plan.iter().map(AuthStrategy::label).collect();
    assert_eq!(labels, ["private-token", "bearer"]);
}

#[test]
fn token_plan_skips_probe_for_non_gitlab_urls() {
    let plan = authentication_plan("https://example.com/scripts/run.sh", &token("t"));
    assert_eq!(plan, vec![AuthStrategy::Bearer { token: String::from("t") }]);
}

#[test]
fn username_plan_uses_basic_auth() {
    let auth = HttpAuth::new(Some(String::from("user")), None, None);
    assert_eq!(
        authentication_plan("https://example.com/run.sh", &auth),
        vec![AuthStrategy::Basic {
            username: String::from("user"),
            password: String::new(),
        }]
    );
}

#[rstest]
#[case(
    "http://192.168.85.27/api/v4/projects/root%2Fmy_project/repository/files/bash_scripts%2Fsimple%2Ebash/raw?ref=main",
    Some("http://192.168.85.27/api/v4/projects/root%2Fmy_project/repository/files/bash_scripts%2Fsimple%2Ebash/raw?ref=main")
)]
#[case(
    "http://192.168.85.27/api/v4/projects/root%2Fmy_project/repository/files/bash_scripts%2Fsimple%2Ebash/raw",
    Some("http://192.168.85.27/api/v4/projects/root%2Fmy_project/repository/files/bash_scripts%2Fsimple%2Ebash/raw")
)]
#[case(
    "http://192.168.85.27/root/my_project/-/raw/main/bash_scripts/simple.bash",
    Some("http://192.168.85.27/api/v4/projects/root%2Fmy_project/repository/files/bash_scripts%2Fsimple%2Ebash/raw?ref=main")
)]
#[case(
    "https://git.corp/group/sub.group/tool/-/BLOB/dev/Run.PS1",
    Some("https://git.corp/api/v4/projects/group%2Fsub%2Egroup%2Ftool/repository/files/Run%2EPS1/raw?ref=dev")
)]
#[case(
    "http://gl.corp/api/v4/projects/7/repository/files/run%2Esh/raw?ref=fresh",
    Some("http://gl.corp/api/v4/projects/7/repository/files/run%2Esh/raw?ref=fresh")
)]
#[case(
    "https://gl.corp/api/v4/projects/7/repository/files/ci%2Fdeploy.ps1?private=1&ref=push-fix",
    Some("https://gl.corp/api/v4/projects/7/repository/files/ci%2Fdeploy%2Eps1/raw?ref=push-fix")
)]
#[case("https://gl.corp/api/v4/projects/7/repository/files/README.md?ref=push", None)]
#[case(
    "https://gl.corp/team/tool/-/blob/main/run.sh?inline=false",
    Some("https://gl.corp/api/v4/projects/team%2Ftool/repository/files/run%2Esh/raw?ref=main")
)]
#[case("https://example.com/scripts/run.sh", None)]
fn gitlab_raw_conversion(#[case] url: &str, #[case] expected: Option<&str>) {
    assert_eq!(gitlab_raw_api_url(url).as_deref(), expected);
}

#[rstest]
#[case("https://github.com/acc/rep/blob/main/run.sh", token("t"), Route::GitHub)]
#[case(
    "https://github.com/acc/rep/blob/main/run.sh",
    HttpAuth::new(Some(String::from("u")), Some(String::from("pat")), None),
    Route::GitHub
)]
#[case("https://github.com/acc/rep/blob/main/run.sh", HttpAuth::anonymous(), Route::Generic)]
#[case("https://gl.corp/api/v4/projects/7/repository/files/run.sh?ref=main", token("t"), Route::GitLab)]
#[case("https://gl.corp/api/v4/projects/7/repository/files/", token("t"), Route::GitLab)]
#[case("https://gl.corp/api/v4/projects/7/repository/files/run%2Esh/raw?ref=main", token("t"), Route::Generic)]
#[case("https://gl.corp/team/tool/-/blob/main/run.sh", token("t"), Route::Generic)]
#[case("https://example.com/run.sh", token("t"), Route::Generic)]
fn routes_by_url_shape_and_secret(#[case] url: &str, #[case] auth: HttpAuth, #[case] expected: Route) {
    assert_eq!(route(url, &auth), expected);
}

#[rstest]
#[case(
    "https://blabla/api/v4/projects/xxx/repository/files/folder1/some_file.txt",
    "xxx",
    "folder1/some_file.txt",
    None,
    "https://blabla"
)]
#[case(
    "https://sub.blabla.com/api/v4/projects/xxx/repository/files/folder1/some_file.txt?ref=master",
    "xxx",
    "folder1/some_file.txt",
    Some("master"),
    "https://sub.blabla.com"
)]
#[case(
    "https://sub.blabla:8080/api/v4/projects/xxx/repository/files/folder1/some_file.txt",
    "xxx",
    "folder1/some_file.txt",
    None,
    "https://sub.blabla:8080"
)]
#[case(
    "https://sub.blabla:8080/api/v4/projects/xxx/repository/files/",
    "xxx",
    "",
    None,
    "https://sub.blabla:8080"
)]
#[case(
    "https://blabla/api/v4/projects/xxx/repository/files/folder1/some_file.txt?bla1=bla1&bla2=bla2",
    "xxx",
    "folder1/some_file.txt",
    None,
    "https://blabla"
)]
fn gitlab_url_extraction(
    #[case] url: &str,
    #[case] project_id: &str,
    #[case] file_path: &str,
    #[case] ref_name: Option<&str>,
    #[case] base_url: &str,
) {
    let data = GitLabDownloader::extract_data(url).expect("GitLab URL should parse");
    assert_eq!(data.project_id, project_id);
    assert_eq!(data.file_path, file_path);
    assert_eq!(data.ref_name.as_deref(), ref_name);
    assert_eq!(data.base_url, base_url);
}

#[test]
fn gitlab_rejects_foreign_urls() {
    let err = GitLabDownloader::validate_url("xxx").expect_err("URL should be rejected");
    assert!(err.to_string().contains("not in the correct format"));
}

#[rstest]
#[case(Some("master"), "folder1/folder2", "https://sub.bla.com/api/v4/projects/xxx/repository/tree?per_page=100&ref=master&path=folder1%2Ffolder2")]
#[case(Some("master"), "", "https://sub.bla.com/api/v4/projects/xxx/repository/tree?per_page=100&ref=master")]
#[case(None, "", "https://sub.bla.com/api/v4/projects/xxx/repository/tree?per_page=100")]
fn gitlab_tree_url(#[case] ref_name: Option<&str>, #[case] file_path: &str, #[case] expected: &str) {
    let data = GitLabUrlData {
        project_id: String::from("xxx"),
        file_path: file_path.to_owned(),
        ref_name: ref_name.map(str::to_owned),
        base_url: String::from("https://sub.bla.com"),
    };
    assert_eq!(GitLabDownloader::tree_url(&data), expected);
}

#[test]
fn gitlab_file_url_defaults_ref_to_master() {
    let data = GitLabUrlData {
        project_id: String::from("42"),
        file_path: String::from("tools"),
        ref_name: None,
        base_url: String::from("https://gl.corp"),
    };
    let entry = TreeEntry::new("main.sh", "blob", "tools/main.sh");
    assert_eq!(
        GitLabDownloader::file_url(&data, &entry),
        "https://gl.corp/api/v4/projects/42/repository/files/tools%2Fmain.sh?ref=master"
    );
}

fn listing() -> Vec<TreeEntry> {
    vec![
        TreeEntry::new("main.ps1", "blob", "main.ps1"),
        TreeEntry::new(".gitignore", "blob", ".gitignore"),
        TreeEntry::new("README.md", "blob", "README.md"),
        TreeEntry::new("lib", "tree", "lib"),
        TreeEntry::new("helper.ps1", "blob", "helper.ps1"),
    ]
}

#[test]
fn junk_filter_keeps_blobs_in_order() {
    let kept = GitLabDownloader::remove_junk(listing());
    let names: Vec<_> = kept.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, ["main.ps1", "helper.ps1"]);
    assert_eq!(GitLabDownloader::remove_junk(kept.clone()), kept);
}

#[rstest]
#[case("main.ps1")]
#[case("main.sh")]
#[case("main.bash")]
fn main_file_is_found(#[case] name: &str) {
    let entries = vec![
        TreeEntry::new("other.sh", "blob", "other.sh"),
        TreeEntry::new(name, "blob", name),
    ];
    let found = GitLabDownloader::main_file(&entries, "dir").expect("main file should be found");
    assert_eq!(found.name, name);
}

#[test]
fn main_file_requires_supported_extension() {
    let entries = vec![TreeEntry::new("main.ps2", "blob", "main.ps2")];
    let err = GitLabDownloader::main_file(&entries, "dir").expect_err("main.ps2 is not a script");
    assert_eq!(err, DownloadError::MainFileNotFound { path: String::from("dir") });
}

#[rstest]
#[tokio::test]
async fn public_download_names_file_from_final_url(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/SomeUser/SomePublicRepo/master/bashScript.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SomeBashScriptContent"))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let url = format!("{}/SomeUser/SomePublicRepo/master/bashScript.sh", server.uri());
    let data = dispatcher
        .download(&url, &HttpAuth::anonymous(), true)
        .await
        .expect("public download should succeed");

    assert_eq!(data.main_script().name(), "bashScript.sh");
    assert_eq!(data.main_script().text(), "SomeBashScriptContent");
    assert!(data.additional_files().is_empty());
}

#[rstest]
#[tokio::test]
async fn token_falls_back_from_gitlab_probe_to_bearer_redirects(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(path_regex("^/api/v4/projects/"))
        .and(header("Private-Token", "tok"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/team/tool/-/raw/main/deploy.sh"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/storage/blob-1/deploy.sh"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/blob-1/deploy.sh"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("echo deployed"))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let url = format!("{}/team/tool/-/raw/main/deploy.sh", server.uri());
    let data = dispatcher
        .download(&url, &token("tok"), true)
        .await
        .expect("bearer download should succeed");

    assert_eq!(data.main_script().name(), "deploy.sh");
    assert_eq!(data.main_script().text(), "echo deployed");
}

#[rstest]
#[tokio::test]
async fn bearer_redirects_are_bounded(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop.sh"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop.sh"))
        .mount(&server)
        .await;

    let config = DownloadConfig {
        max_redirects: 2,
        ..config
    };
    let downloader = GenericHttpDownloader::new(&config, CancellationSampler::new(), true)
        .expect("client should build");
    let url = format!("{}/loop.sh", server.uri());
    let err = downloader
        .download_script(&url, &token("tok"))
        .await
        .expect_err("redirect loop should fail");

    assert!(matches!(err, DownloadError::HttpStatus { status: 302, .. }), "unexpected error: {err}");
}

#[rstest]
#[tokio::test]
async fn basic_auth_and_content_disposition(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/artifacts/42"))
        .and(header("Authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Disposition", "attachment; filename=\"setup.ps1\"")
                .set_body_string("Write-Output 'ok'"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let auth = HttpAuth::new(Some(String::from("user")), Some(String::from("pass")), None);
    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let data = dispatcher
        .download(&format!("{}/artifacts/42", server.uri()), &auth, true)
        .await
        .expect("basic auth download should succeed");

    assert_eq!(data.main_script().name(), "setup.ps1");
}

#[rstest]
#[tokio::test]
async fn refused_request_reports_status(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let err = dispatcher
        .download(&format!("{}/private.sh", server.uri()), &token("tok"), true)
        .await
        .expect_err("forbidden download should fail");

    assert!(matches!(err, DownloadError::HttpStatus { status: 403, .. }));
    assert!(err.to_string().contains("403 Forbidden"), "unexpected message: {err}");
}

#[rstest]
#[tokio::test]
async fn html_pages_are_rejected(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login/run.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("\n<!DOCTYPE html><html>sign in</html>"))
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let err = dispatcher
        .download(&format!("{}/login/run.sh", server.uri()), &HttpAuth::anonymous(), true)
        .await
        .expect_err("html should be rejected");

    assert!(matches!(err, DownloadError::NotAScript { .. }));
}

#[rstest]
#[tokio::test]
async fn unnamed_payloads_are_rejected(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("echo hi"))
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let err = dispatcher
        .download(&format!("{}/notes.txt", server.uri()), &HttpAuth::anonymous(), true)
        .await
        .expect_err("txt should be rejected");

    assert_eq!(err, DownloadError::UnsupportedFileType { name: None });
}

#[rstest]
#[tokio::test]
async fn cancelled_dispatcher_does_not_issue_requests(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("echo hi"))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationSampler::new();
    cancel.cancel();
    let dispatcher = DownloadDispatcher::new(config, cancel);
    let err = dispatcher
        .download(&format!("{}/run.sh", server.uri()), &HttpAuth::anonymous(), true)
        .await
        .expect_err("cancelled download should fail");

    assert!(matches!(err, DownloadError::Cancelled(_)));
}

#[rstest]
#[tokio::test]
async fn cancellation_during_a_streamed_body_stops_the_download(config: DownloadConfig) {
    let server = MockServer::start().await;
    let cancel = CancellationSampler::new();
    let body = "echo streamed\n".repeat(64 * 1024);
    Mock::given(method("GET"))
        .and(path("/scripts/long.sh"))
        .respond_with(CancelWhenServed {
            cancel: cancel.clone(),
            response: ResponseTemplate::new(200).set_body_string(body),
        })
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, cancel);
    let err = dispatcher
        .download(&format!("{}/scripts/long.sh", server.uri()), &HttpAuth::anonymous(), true)
        .await
        .expect_err("body reading should observe the cancellation");

    assert!(matches!(err, DownloadError::Cancelled(_)));
}

#[rstest]
#[tokio::test]
async fn github_download_observes_cancellation_after_decoding(config: DownloadConfig) {
    let server = MockServer::start().await;
    let cancel = CancellationSampler::new();
    Mock::given(method("GET"))
        .and(path("/repos/acc/rep/contents/fol/f.sh"))
        .respond_with(CancelWhenServed {
            cancel: cancel.clone(),
            response: ResponseTemplate::new(200).set_body_json(json!({
                "path": "fol/f.sh",
                "content": encoded("echo from github"),
            })),
        })
        .expect(1)
        .mount(&server)
        .await;

    let downloader =
        GitHubDownloader::new(&config, cancel, true).expect("client should build");
    let api_url = format!("{}/repos/acc/rep/contents/fol/f.sh?ref=bra", server.uri());
    let err = downloader
        .download_file(&api_url, &token("s3cret"))
        .await
        .expect_err("decoded file should not be returned once cancelled");

    assert!(matches!(err, DownloadError::Cancelled(_)));
}

#[rstest]
#[tokio::test]
async fn github_contents_api_download(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acc/rep/contents/fol/f.sh"))
        .and(query_param("ref", "bra"))
        .and(header("Authorization", "token s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "fol/f.sh",
            "content": format!("{}\n", encoded("echo from github")),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let downloader = GitHubDownloader::new(&config, CancellationSampler::new(), true)
        .expect("client should build");
    let api_url = format!("{}/repos/acc/rep/contents/fol/f.sh?ref=bra", server.uri());
    let script = downloader
        .download_file(&api_url, &token("s3cret"))
        .await
        .expect("contents download should succeed");

    assert_eq!(script.name(), "f.sh");
    assert_eq!(script.text(), "echo from github");
}

#[rstest]
#[tokio::test]
async fn github_directories_are_unsupported(config: DownloadConfig) {
    let downloader = GitHubDownloader::new(&config, CancellationSampler::new(), true)
        .expect("client should build");
    let err = downloader
        .download("https://github.com/acc/rep/blob/main/scripts", &token("t"))
        .await
        .expect_err("directories are unsupported");

    assert!(matches!(err, DownloadError::DirectoryNotSupported { .. }));
}

#[rstest]
#[tokio::test]
async fn gitlab_single_file_download(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"/repository/files/tools%2Frun\.sh$"))
        .and(query_param("ref", "main"))
        .and(header("PRIVATE-TOKEN", "s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "file_name": "run.sh",
            "content": encoded("echo single"),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let url = format!("{}/api/v4/projects/42/repository/files/tools%2Frun.sh?ref=main", server.uri());
    let data = dispatcher
        .download(&url, &token("s3cret"), true)
        .await
        .expect("single file download should succeed");

    assert_eq!(data.main_script(), &crate::script::ScriptFile::new("run.sh", "echo single"));
    assert!(data.additional_files().is_empty());
}

#[rstest]
#[tokio::test]
async fn gitlab_directory_download_collects_companions(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/42/repository/tree"))
        .and(query_param("per_page", "100"))
        .and(query_param("ref", "main"))
        .and(query_param("path", "tools"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "lib.sh", "type": "blob", "path": "tools/lib.sh"},
            {"name": "README.md", "type": "blob", "path": "tools/README.md"},
            {"name": "main.sh", "type": "blob", "path": "tools/main.sh"},
            {"name": ".env", "type": "blob", "path": "tools/.env"},
            {"name": "nested", "type": "tree", "path": "tools/nested"},
            {"name": "data.sh", "type": "blob", "path": "tools/data.sh"},
        ])))
        .expect(1)
        .mount(&server)
        .await;
    for (name, body) in [("main.sh", "source lib.sh"), ("lib.sh", "f() { :; }"), ("data.sh", "X=1")] {
        Mock::given(method("GET"))
            .and(path_regex(format!(r"/repository/files/tools%2F{}$", regex::escape(name))))
            .and(query_param("ref", "main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "file_name": name,
                "content": encoded(body),
            })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dispatcher = DownloadDispatcher::new(config, CancellationSampler::new());
    let url = format!("{}/api/v4/projects/42/repository/files/tools?ref=main", server.uri());
    let data = dispatcher
        .download(&url, &token("s3cret"), true)
        .await
        .expect("directory download should succeed");

    assert_eq!(data.main_script().name(), "main.sh");
    assert_eq!(data.main_script().text(), "source lib.sh");
    let companions: Vec<_> = data.additional_files().iter().map(|file| file.name()).collect();
    assert_eq!(companions, ["lib.sh", "data.sh"]);
}

#[rstest]
#[tokio::test]
async fn gitlab_directory_stops_fetching_once_cancelled(config: DownloadConfig) {
    let server = MockServer::start().await;
    let cancel = CancellationSampler::new();
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/42/repository/tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "main.sh", "type": "blob", "path": "tools/main.sh"},
            {"name": "lib.sh", "type": "blob", "path": "tools/lib.sh"},
            {"name": "data.sh", "type": "blob", "path": "tools/data.sh"},
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"/repository/files/tools%2Fmain\.sh$"))
        .respond_with(CancelWhenServed {
            cancel: cancel.clone(),
            response: ResponseTemplate::new(200).set_body_json(json!({
                "file_name": "main.sh",
                "content": encoded("source lib.sh"),
            })),
        })
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"/repository/files/tools%2F(lib|data)\.sh$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "file_name": "lib.sh",
            "content": encoded("f() { :; }"),
        })))
        .expect(0)
        .mount(&server)
        .await;

    let dispatcher = DownloadDispatcher::new(config, cancel);
    let url = format!("{}/api/v4/projects/42/repository/files/tools?ref=main", server.uri());
    let err = dispatcher
        .download(&url, &token("s3cret"), true)
        .await
        .expect_err("companions must not be fetched after cancellation");

    assert!(matches!(err, DownloadError::Cancelled(_)));
}

#[rstest]
#[tokio::test]
async fn gitlab_directory_without_main_file_fails(config: DownloadConfig) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/42/repository/tree"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "main.ps2", "type": "blob", "path": "main.ps2"},
        ])))
        .mount(&server)
        .await;

    let downloader = GitLabDownloader::new(&config, CancellationSampler::new(), true)
        .expect("client should build");
    let url = format!("{}/api/v4/projects/42/repository/files/", server.uri());
    let err = downloader
        .download(&url, &token("s3cret"))
        .await
        .expect_err("listing without main file should fail");

    assert!(matches!(err, DownloadError::MainFileNotFound { .. }));
}
