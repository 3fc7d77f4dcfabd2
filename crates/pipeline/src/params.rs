//! Run parameters passed through to the pipeline executable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_run_name() -> String {
    "single_table".to_string()
}

fn default_epochs_vae() -> u32 {
    10
}

fn default_epochs_gnn() -> u32 {
    10
}

fn default_epochs_diff() -> u32 {
    1
}

/// Parameters for one generation run. Opaque to the scheduler; only the
/// adapter interprets them when assembling the pipeline command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    pub dataset: String,
    pub table: String,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    #[serde(default = "default_epochs_vae")]
    pub epochs_vae: u32,
    #[serde(default = "default_epochs_gnn")]
    pub epochs_gnn: u32,
    #[serde(default = "default_epochs_diff")]
    pub epochs_diff: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_samples: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl RunParams {
    /// CLI arguments for the pipeline entry point.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--dataset-name".to_string(),
            self.dataset.clone(),
            "--target-table".to_string(),
            self.table.clone(),
            "--epochs-gnn".to_string(),
            self.epochs_gnn.to_string(),
            "--epochs-vae".to_string(),
            self.epochs_vae.to_string(),
            "--epochs-diff".to_string(),
            self.epochs_diff.to_string(),
        ];
        if let Some(num_samples) = self.num_samples {
            args.push("--num-samples".to_string());
            args.push(num_samples.to_string());
        }
        if let Some(seed) = self.seed {
            args.push("--seed".to_string());
            args.push(seed.to_string());
        }
        args
    }

    /// Where the pipeline writes its output CSV, relative to the data
    /// root. The run has not succeeded until this file exists.
    pub fn output_relpath(&self) -> PathBuf {
        PathBuf::from("synthetic")
            .join(&self.dataset)
            .join("SingleTable")
            .join(&self.run_name)
            .join(format!("{}.csv", self.table))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RunParams {
        serde_json::from_value(serde_json::json!({
            "dataset": "AIDS",
            "table": "patients",
        }))
        .unwrap()
    }

    #[test]
    fn defaults_applied_when_fields_omitted() {
        let p = params();
        assert_eq!(p.run_name, "single_table");
        assert_eq!(p.epochs_vae, 10);
        assert_eq!(p.epochs_gnn, 10);
        assert_eq!(p.epochs_diff, 1);
        assert!(p.num_samples.is_none());
    }

    #[test]
    fn args_cover_all_required_flags() {
        let args = params().to_args();
        assert_eq!(
            args,
            vec![
                "--dataset-name",
                "AIDS",
                "--target-table",
                "patients",
                "--epochs-gnn",
                "10",
                "--epochs-vae",
                "10",
                "--epochs-diff",
                "1",
            ]
        );
    }

    #[test]
    fn optional_flags_appended_when_set() {
        let mut p = params();
        p.num_samples = Some(500);
        p.seed = Some(42);
        let args = p.to_args();
        assert!(args.windows(2).any(|w| w == ["--num-samples", "500"]));
        assert!(args.windows(2).any(|w| w == ["--seed", "42"]));
    }

    #[test]
    fn output_path_follows_the_pipeline_layout() {
        assert_eq!(
            params().output_relpath(),
            PathBuf::from("synthetic/AIDS/SingleTable/single_table/patients.csv")
        );
    }
}
