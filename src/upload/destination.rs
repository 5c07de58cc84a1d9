use std::fmt;
use uuid::Uuid;

use crate::media::CandidateFile;

/// Object path inside the bucket: `{namespace}/{user id}/{uuid}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadDestination {
    path: String,
}

impl UploadDestination {
    /// Generate a fresh destination for one upload attempt
    pub fn generate(namespace: &str, user_id: &str, file: &CandidateFile) -> Self {
        let unique_name = match file.extension() {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };

        let namespace = namespace.trim_matches('/');
        let path = if namespace.is_empty() {
            format!("{}/{}", user_id, unique_name)
        } else {
            format!("{}/{}/{}", namespace, user_id, unique_name)
        };

        Self { path }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Path with every segment percent-encoded, ready to append to a URL
    pub fn url_encoded(&self) -> String {
        self.path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for UploadDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
