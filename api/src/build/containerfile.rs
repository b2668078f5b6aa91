//! Assembly of the container build file for an app image. Two paths: rewrite
//! the repository's own file around the platform base image, or synthesize
//! one from the declared dependencies.

use binder_common::app::{AppSpec, Dependency};
use binder_common::config::BASE_IMAGE;

/// Result of rewriting a repository-shipped build file. `foreign_base` is
/// set when the repository was based on something other than the platform
/// base image; the build proceeds but may fail.
pub struct Rewritten {
    pub dockerfile: String,
    pub foreign_base: bool,
}

/// Strip the repository's base-image directives and rebuild the file around
/// the configured base image. The build runs with the repository as its
/// context, so the notebooks source path defaults to `.`.
pub fn rewrite_repo_dockerfile(
    repo_dockerfile: &str,
    base_image: &str,
    notebooks: Option<&str>,
    suffix: &str,
) -> Rewritten {
    let mut foreign_base = false;
    let expected_base = format!("/{BASE_IMAGE}");

    let mut dockerfile = format!("FROM {base_image}\n");
    for line in repo_dockerfile.lines() {
        if line.trim_start().starts_with("FROM ") {
            if !line.trim_end().ends_with(&expected_base) {
                foreign_base = true;
            }
            continue;
        }
        dockerfile.push_str(line);
        dockerfile.push('\n');
    }

    dockerfile.push_str("\nUSER main\n\n");
    dockerfile.push_str(&format!(
        "ADD {} $HOME/notebooks\n\n",
        notebooks.unwrap_or(".")
    ));
    push_suffix(&mut dockerfile, suffix);

    Rewritten {
        dockerfile,
        foreign_base,
    }
}

/// Synthesize the whole build file from the spec's dependencies. The build
/// context is the app directory, with the repository checked out under
/// `repo/`.
pub fn synthesize_dockerfile(
    spec: &AppSpec,
    base_image: &str,
    clients: &[(String, String)],
    suffix: &str,
) -> String {
    let mut dockerfile = format!("FROM {base_image}\n\n");

    if spec.has_dependency(Dependency::Requirements) {
        let source = spec.requirements.as_deref().unwrap_or("repo/requirements.txt");
        dockerfile.push_str(&format!("ADD {source} requirements.txt\n"));
        dockerfile.push_str("ADD handle-requirements.py handle-requirements.py\n");
        dockerfile.push_str("RUN python handle-requirements.py\n\n");
    }

    if spec.has_dependency(Dependency::CondaEnvironment) {
        dockerfile.push_str("ADD repo/environment.yml environment.yml\n");
        // The environment name is forced so later lines can activate it
        dockerfile.push_str("RUN conda env create -n binder\n");
        dockerfile.push_str(
            "RUN echo \"export PATH=/home/main/anaconda/envs/binder/bin/:$PATH\" >> ~/.binder_start\n",
        );
        // The notebook kernel has to exist inside the new environment
        dockerfile.push_str("RUN conda install -n binder jupyter\n");
        dockerfile.push_str(
            "RUN /bin/bash -c \"source activate binder && ipython kernelspec install-self --user\"\n\n",
        );
    }

    for (name, client) in clients {
        dockerfile.push_str(&format!("# {name} client\n"));
        dockerfile.push_str(client);
        if !client.ends_with('\n') {
            dockerfile.push('\n');
        }
        dockerfile.push('\n');
    }

    dockerfile.push_str(&format!(
        "ADD {} $HOME/notebooks\n\n",
        spec.notebooks.as_deref().unwrap_or("repo")
    ));
    push_suffix(&mut dockerfile, suffix);

    dockerfile
}

fn push_suffix(dockerfile: &mut String, suffix: &str) {
    dockerfile.push_str(suffix);
    if !suffix.ends_with('\n') {
        dockerfile.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SUFFIX: &str = "EXPOSE 8888\nCMD [\"start-notebook\"]\n";

    fn base() -> String {
        format!("gcr.io/proj/{BASE_IMAGE}")
    }

    fn from_lines(dockerfile: &str) -> Vec<&str> {
        dockerfile
            .lines()
            .filter(|line| line.starts_with("FROM "))
            .collect()
    }

    #[test]
    fn rewrite_replaces_the_base_directive() {
        let repo = "FROM gcr.io/other/binder-base\nRUN pip install scipy\n";
        let rewritten = rewrite_repo_dockerfile(repo, &base(), None, SUFFIX);

        assert_eq!(from_lines(&rewritten.dockerfile), vec![format!("FROM {}", base())]);
        assert!(!rewritten.foreign_base);
        assert!(rewritten.dockerfile.contains("RUN pip install scipy"));
        assert!(rewritten.dockerfile.contains("USER main"));
        assert!(rewritten.dockerfile.contains("ADD . $HOME/notebooks"));
        assert!(rewritten.dockerfile.ends_with(SUFFIX));
    }

    #[test]
    fn rewrite_flags_foreign_bases() {
        let repo = "FROM ubuntu:14.04\nRUN apt-get update\n";
        let rewritten = rewrite_repo_dockerfile(repo, &base(), Some("nb"), SUFFIX);

        assert!(rewritten.foreign_base);
        assert_eq!(from_lines(&rewritten.dockerfile).len(), 1);
        assert!(rewritten.dockerfile.contains("ADD nb $HOME/notebooks"));
    }

    #[test]
    fn synthesized_file_has_exactly_one_base_directive() {
        let mut spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        spec.dependencies = vec![Dependency::Requirements, Dependency::CondaEnvironment];

        let dockerfile = synthesize_dockerfile(&spec, &base(), &[], SUFFIX);

        assert_eq!(from_lines(&dockerfile), vec![format!("FROM {}", base())]);
        assert!(dockerfile.contains("ADD repo/requirements.txt requirements.txt"));
        assert!(dockerfile.contains("RUN python handle-requirements.py"));
        assert!(dockerfile.contains("RUN conda env create -n binder"));
        assert!(dockerfile.contains("ADD repo $HOME/notebooks"));
        assert!(dockerfile.ends_with(SUFFIX));
    }

    #[test]
    fn synthesized_file_without_dependencies_is_still_based() {
        let spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        let dockerfile = synthesize_dockerfile(&spec, &base(), &[], SUFFIX);

        assert_eq!(from_lines(&dockerfile), vec![format!("FROM {}", base())]);
        assert!(!dockerfile.contains("requirements.txt"));
        assert!(!dockerfile.contains("conda"));
    }

    #[test]
    fn service_clients_are_appended_in_order() {
        let spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        let clients = vec![
            ("spark".to_string(), "RUN install-spark\n".to_string()),
            ("redis".to_string(), "RUN install-redis".to_string()),
        ];

        let dockerfile = synthesize_dockerfile(&spec, &base(), &clients, SUFFIX);

        let spark = dockerfile.find("# spark client\nRUN install-spark").unwrap();
        let redis = dockerfile.find("# redis client\nRUN install-redis").unwrap();
        assert!(spark < redis);
    }

    #[test]
    fn custom_requirements_path_is_used() {
        let mut spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        spec.dependencies = vec![Dependency::Requirements];
        spec.requirements = Some("repo/deps/requirements.txt".to_string());

        let dockerfile = synthesize_dockerfile(&spec, &base(), &[], SUFFIX);

        assert!(dockerfile.contains("ADD repo/deps/requirements.txt requirements.txt"));
    }
}
