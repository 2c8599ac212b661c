//! End-to-end flow: fetch a public script over HTTP, then run it through a
//! scripted remote shell.

#[path = "common/remote_fixtures.rs"]
mod remote_fixtures;

use remote_fixtures::{TEMP_FOLDER, connected_session, uploaded_bytes};
use scriptferry::remote::Dialect;
use scriptferry::test_support::{RecordingSink, ScriptedShell};
use scriptferry::{CancellationSampler, DownloadConfig, DownloadDispatcher, DownloadError, HttpAuth};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn public_script_is_downloaded_and_executed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/SomeUser/SomePublicRepo/master/bashScript.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SomeBashScriptContent"))
        .expect(1)
        .mount(&server)
        .await;
    let cancel = CancellationSampler::new();
    let dispatcher = DownloadDispatcher::new(DownloadConfig::default(), cancel.clone());

    let url = format!("{}/SomeUser/SomePublicRepo/master/bashScript.sh", server.uri());
    let data = dispatcher
        .download(&url, &HttpAuth::anonymous(), true)
        .await
        .expect("public download should succeed");
    let script = data.main_script();
    assert_eq!(script.name(), "bashScript.sh");
    assert_eq!(script.text(), "SomeBashScriptContent");

    let shell = ScriptedShell::new(Dialect::Posix);
    let session = connected_session(&shell, 2000, cancel).await;
    shell.push_output(0, format!("{TEMP_FOLDER}\n"), "");
    shell.push_success();
    shell.push_output(0, "ran\n", "");
    let sink = RecordingSink::new();

    session
        .execute_bundle(&data, &[], &sink, true)
        .await
        .expect("execution should succeed");

    assert_eq!(
        uploaded_bytes(Dialect::Posix, &shell.commands()),
        b"SomeBashScriptContent"
    );
    assert_eq!(sink.outputs(), ["ran\n", ""]);
    assert_eq!(shell.leaked_commands(), 0);
}

#[tokio::test]
async fn private_script_without_credentials_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let dispatcher = DownloadDispatcher::new(DownloadConfig::default(), CancellationSampler::new());

    let err = dispatcher
        .download(
            &format!("{}/private/deploy.ps1", server.uri()),
            &HttpAuth::anonymous(),
            true,
        )
        .await
        .expect_err("404 should fail");

    assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
}
