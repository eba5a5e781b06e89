//! Repo definition installation against a wiremock content server

use std::fs;
use systemprep::config::ParameterSet;
use systemprep::error::PlatformError;
use systemprep::fetch::ResourceFetcher;
use systemprep::steps::{RepoPaths, YumRepoParams, install_repos};
use systemprep::PrepError;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn repo_map(server: &MockServer) -> String {
    format!(
        r#"yumrepomap=[
            {{"url": "{0}/repos/amzn.repo", "dist": "amazon"}},
            {{"url": "{0}/repos/rhel.repo", "dist": "redhat"}},
            {{"url": "{0}/repos/salt-el6.repo", "dist": "all", "epel_version": "6"}},
            {{"url": "{0}/repos/salt-el7.repo", "dist": "all", "epel_version": "7"}}
        ]"#,
        server.uri()
    )
}

fn paths(dir: &TempDir, release: &str) -> RepoPaths {
    let release_file = dir.path().join("system-release");
    fs::write(&release_file, release).unwrap();
    let repo_dir = dir.path().join("yum.repos.d");
    fs::create_dir_all(&repo_dir).unwrap();
    RepoPaths {
        release_file,
        repo_dir,
    }
}

/// Only the repos for this dist and EPEL version are downloaded
#[tokio::test]
async fn test_install_matching_repos() {
    let server = MockServer::start().await;
    for name in ["amzn.repo", "salt-el6.repo"] {
        Mock::given(method("GET"))
            .and(path(format!("/repos/{}", name)))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("[{}]\n", name)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let paths = paths(&dir, "Amazon Linux AMI release 2015.03\n");
    let params: YumRepoParams = ParameterSet::from_args([repo_map(&server)])
        .unwrap()
        .decode()
        .unwrap();

    let installed = install_repos(&params, &paths, &ResourceFetcher::new().unwrap())
        .await
        .unwrap();

    assert_eq!(
        installed,
        vec![
            paths.repo_dir.join("amzn.repo"),
            paths.repo_dir.join("salt-el6.repo"),
        ]
    );
    assert_eq!(
        fs::read_to_string(paths.repo_dir.join("salt-el6.repo")).unwrap(),
        "[salt-el6.repo]\n"
    );
}

/// An unrecognized distribution is an error and nothing is downloaded
#[tokio::test]
async fn test_unsupported_distribution() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let paths = paths(&dir, "Debian GNU/Linux 8\n");
    let params: YumRepoParams = ParameterSet::from_args([repo_map(&server)])
        .unwrap()
        .decode()
        .unwrap();

    let err = install_repos(&params, &paths, &ResourceFetcher::new().unwrap())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PrepError::Platform(PlatformError::UnsupportedDistribution(_))
    ));
}
