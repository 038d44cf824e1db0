//! Wire types for the LISTEN.moe GraphQL endpoint (favorites only).

use serde::{Deserialize, Serialize};

pub const CHECK_FAVORITE_QUERY: &str = "query checkFavorite($songs: [Int!]!) {
  checkFavorite(songs: $songs)
}";

pub const FAVORITE_SONG_MUTATION: &str = "mutation favoriteSong($id: Int!) {
  favoriteSong(id: $id) {
    id
  }
}";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest<V> {
    pub operation_name: &'static str,
    pub query: &'static str,
    pub variables: V,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckFavoriteVariables {
    pub songs: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FavoriteSongVariables {
    pub id: i64,
}

impl GraphqlRequest<CheckFavoriteVariables> {
    pub fn check_favorite(songs: Vec<i64>) -> Self {
        Self {
            operation_name: "checkFavorite",
            query: CHECK_FAVORITE_QUERY,
            variables: CheckFavoriteVariables { songs },
        }
    }
}

impl GraphqlRequest<FavoriteSongVariables> {
    pub fn favorite_song(id: i64) -> Self {
        Self {
            operation_name: "favoriteSong",
            query: FAVORITE_SONG_MUTATION,
            variables: FavoriteSongVariables { id },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    pub errors: Option<Vec<GraphqlError>>,
}

impl<T> GraphqlResponse<T> {
    /// Errors win over partial data; a body with neither is an error too.
    pub fn into_result(self) -> Result<T, String> {
        if let Some(errors) = self.errors.filter(|e| !e.is_empty()) {
            return Err(errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; "));
        }
        self.data
            .ok_or_else(|| "response carried neither data nor errors".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckFavoriteData {
    #[serde(rename = "checkFavorite", default)]
    pub check_favorite: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FavoriteSongData {
    #[serde(rename = "favoriteSong", default)]
    pub favorite_song: Option<FavoriteSongResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FavoriteSongResult {
    pub id: i64,
}
