//! 实体类型枚举 - 同步阶段的受控枚举
//!
//! 同步顺序固定：profile → history → cultural-progress → achievements，
//! 新增类型需同时更新本地键、远端记录类型与阶段进度。

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::remote::RecordType;

/// 实体类型（每种对应一个同步阶段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Profile,
    GameHistory,
    CulturalProgress,
    Achievements,
}

impl EntityType {
    /// 完整同步的阶段顺序
    pub const SYNC_ORDER: [EntityType; 4] = [
        EntityType::Profile,
        EntityType::GameHistory,
        EntityType::CulturalProgress,
        EntityType::Achievements,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::GameHistory => "game_history",
            Self::CulturalProgress => "cultural_progress",
            Self::Achievements => "achievements",
        }
    }

    /// 本地持久化键（Local Store）
    pub fn local_key(self) -> &'static str {
        match self {
            Self::Profile => "local_player_profile",
            Self::GameHistory => "local_game_records",
            Self::CulturalProgress => "local_cultural_progress",
            Self::Achievements => "local_achievements",
        }
    }

    /// 远端记录容器类型；历史在远端按单局 GameRecord 存储
    pub fn record_type(self) -> RecordType {
        match self {
            Self::Profile => RecordType::PlayerProfile,
            Self::GameHistory => RecordType::GameRecord,
            Self::CulturalProgress => RecordType::CulturalProgress,
            Self::Achievements => RecordType::Achievements,
        }
    }

    /// 该阶段完成后发布的整体进度（0.25 / 0.5 / 0.75 / 1.0）
    pub fn phase_progress(self) -> f64 {
        let index = Self::SYNC_ORDER
            .iter()
            .position(|t| *t == self)
            .unwrap_or(0);
        (index + 1) as f64 / Self::SYNC_ORDER.len() as f64
    }
}

impl FromStr for EntityType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(Self::Profile),
            "game_history" => Ok(Self::GameHistory),
            "cultural_progress" => Ok(Self::CulturalProgress),
            "achievements" => Ok(Self::Achievements),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn entity_type_as_str_and_from_str() {
        assert_eq!(EntityType::Profile.as_str(), "profile");
        assert_eq!(EntityType::GameHistory.as_str(), "game_history");
        assert_eq!(EntityType::from_str("achievements").unwrap(), EntityType::Achievements);
        assert_eq!(
            EntityType::from_str("cultural_progress").unwrap(),
            EntityType::CulturalProgress
        );
        assert!(EntityType::from_str("unknown").is_err());
    }

    #[test]
    fn local_keys_match_persistence_contract() {
        assert_eq!(EntityType::Profile.local_key(), "local_player_profile");
        assert_eq!(EntityType::GameHistory.local_key(), "local_game_records");
        assert_eq!(EntityType::CulturalProgress.local_key(), "local_cultural_progress");
        assert_eq!(EntityType::Achievements.local_key(), "local_achievements");
    }

    #[test]
    fn phase_progress_follows_sync_order() {
        assert_eq!(EntityType::Profile.phase_progress(), 0.25);
        assert_eq!(EntityType::GameHistory.phase_progress(), 0.5);
        assert_eq!(EntityType::CulturalProgress.phase_progress(), 0.75);
        assert_eq!(EntityType::Achievements.phase_progress(), 1.0);
    }
}
