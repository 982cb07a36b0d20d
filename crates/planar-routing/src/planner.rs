//! The path planner: track-graph search and command emission.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;

use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Directed;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use planar_core::{DeckConfig, Location, Position, Track, TrackId, TrackMap, CONNECT_EPSILON_MM};

/// Planner tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Cruise speed along tracks and free moves, mm/s.
    pub cruise_speed_mm_s: f64,
    /// Fixed time to cross a junction between connected tracks.
    pub transition_time: Duration,
    /// Fixed overhead for hopping on or off a track.
    pub hop_time: Duration,
    /// In-place rotation speed, degrees/s.
    pub rotate_speed_deg_s: f64,
    /// Below this separation, source and destination are the same point.
    pub arrival_epsilon_mm: f64,
    /// Below this heading delta no final rotation is planned.
    pub heading_epsilon_deg: f64,
    /// Endpoint separation under which two tracks are connected.
    pub connect_epsilon_mm: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            cruise_speed_mm_s: 250.0,
            transition_time: Duration::from_millis(300),
            hop_time: Duration::from_millis(500),
            rotate_speed_deg_s: 90.0,
            arrival_epsilon_mm: 1.0,
            heading_epsilon_deg: 1.0,
            connect_epsilon_mm: CONNECT_EPSILON_MM,
        }
    }
}

/// Primitive motion commands understood by the physical driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrimitiveCommand {
    /// Move onto a track at a signed distance from its start endpoint.
    HopOn { track_id: TrackId, distance: f64 },
    /// Traverse along the current track to a new signed distance.
    Follow {
        track_id: TrackId,
        target_distance: f64,
    },
    /// Cross between two connected tracks at a junction.
    Transition {
        from_track: TrackId,
        to_track: TrackId,
    },
    /// Leave the current track onto free tile coordinates.
    HopOff { x: f64, y: f64 },
    /// Short off-track motion, only ever within a single tile.
    FreeMove { x: f64, y: f64, c: f64 },
    /// In-place rotation to a target heading.
    Rotate { c: f64 },
}

/// Track coordinate of a planned pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackCoord {
    pub track_id: TrackId,
    pub distance: f64,
}

/// Pose a command leaves the mover in.
///
/// Carried on every planned command so executors update physical state
/// without re-deriving geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannedPose {
    pub position: Position,
    pub track: Option<TrackCoord>,
}

/// A primitive command with its cost estimate and resulting pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCommand {
    pub command: PrimitiveCommand,
    pub estimated: Duration,
    pub pose: PlannedPose,
}

/// An ordered motion plan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub commands: Vec<PlannedCommand>,
    /// Total travel distance in millimeters.
    pub total_cost_mm: f64,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sum of the per-command duration estimates.
    pub fn estimated_duration(&self) -> Duration {
        self.commands.iter().map(|c| c.estimated).sum()
    }
}

/// Routing failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    /// The source and destination tracks are disconnected.
    #[error("no route between track {from_track} and track {to_track}")]
    NoRoute {
        from_track: TrackId,
        to_track: TrackId,
    },

    /// Cross-tile motion was requested with no usable track network.
    #[error("no track network reaches ({x:.1}, {y:.1})")]
    OffNetwork { x: f64, y: f64 },

    /// The destination does not lie on an enabled stator tile.
    #[error("destination ({x:.1}, {y:.1}) is not on an enabled tile")]
    Unreachable { x: f64, y: f64 },
}

/// Pure path planner over an immutable deck/track snapshot.
pub struct PathPlanner {
    deck: DeckConfig,
    tracks: TrackMap,
    config: PlannerConfig,
    graph: Graph<TrackId, f64, Directed>,
    nodes: BTreeMap<TrackId, NodeIndex>,
}

impl PathPlanner {
    /// Build a planner from a deck/track snapshot.
    ///
    /// The track connectivity graph is built once here; edges lead onto
    /// a neighbouring track and are weighted by that track's length.
    pub fn new(deck: DeckConfig, tracks: TrackMap, config: PlannerConfig) -> Self {
        let mut graph = Graph::new();
        let mut nodes = BTreeMap::new();

        for track in tracks.iter() {
            let index = graph.add_node(track.track_id);
            nodes.insert(track.track_id, index);
        }
        for track in tracks.iter() {
            for neighbour in tracks.connected(track.track_id, config.connect_epsilon_mm) {
                if let (Some(&from), Some(&to), Some(target)) = (
                    nodes.get(&track.track_id),
                    nodes.get(&neighbour),
                    tracks.get(neighbour),
                ) {
                    graph.add_edge(from, to, target.length());
                }
            }
        }

        Self {
            deck,
            tracks,
            config,
            graph,
            nodes,
        }
    }

    pub fn deck(&self) -> &DeckConfig {
        &self.deck
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan to a teach point, honoring its track coordinates if present.
    pub fn plan_to_location(&self, from: Position, to: &Location) -> Result<Plan, PlanError> {
        let target = to.position();
        let track_hint = match (to.track_id, to.track_distance) {
            (Some(track_id), Some(distance)) => Some(TrackCoord { track_id, distance }),
            _ => None,
        };
        self.plan_inner(from, target, track_hint)
    }

    /// Plan between two absolute positions.
    pub fn plan(&self, from: Position, to: Position) -> Result<Plan, PlanError> {
        self.plan_inner(from, to, None)
    }

    /// Cheap cost probe used for nearest-mover selection.
    pub fn estimate(&self, from: Position, to: Position) -> Option<f64> {
        self.plan(from, to).ok().map(|p| p.total_cost_mm)
    }

    fn plan_inner(
        &self,
        from: Position,
        to: Position,
        track_hint: Option<TrackCoord>,
    ) -> Result<Plan, PlanError> {
        // Already there: an empty plan, not an error.
        if from.distance_to(&to) <= self.config.arrival_epsilon_mm {
            if self.heading_delta(from.c, to.c) > self.config.heading_epsilon_deg {
                let mut plan = Plan::default();
                self.push_rotate(&mut plan, to, None);
                return Ok(plan);
            }
            return Ok(Plan::default());
        }

        if !self.deck.is_traversable(to.x, to.y) {
            return Err(PlanError::Unreachable { x: to.x, y: to.y });
        }

        // Within a single tile, free motion is always allowed.
        if from.grid() == to.grid() {
            return Ok(self.free_move_plan(from, to));
        }

        let source = self
            .tracks
            .nearest_point(from.x, from.y)
            .ok_or(PlanError::OffNetwork { x: to.x, y: to.y })?;
        let target = match track_hint {
            Some(coord) => coord,
            None => {
                let nearest = self
                    .tracks
                    .nearest_point(to.x, to.y)
                    .ok_or(PlanError::OffNetwork { x: to.x, y: to.y })?;
                TrackCoord {
                    track_id: nearest.track_id,
                    distance: nearest.distance_along,
                }
            }
        };

        let route = self.shortest_route(source.track_id, target.track_id)?;
        self.emit_route(from, to, source.distance_along, target, &route)
    }

    fn heading_delta(&self, a: f64, b: f64) -> f64 {
        let mut delta = (b - a).abs() % 360.0;
        if delta > 180.0 {
            delta = 360.0 - delta;
        }
        delta
    }

    fn free_move_plan(&self, from: Position, to: Position) -> Plan {
        let mut plan = Plan::default();
        let distance = from.distance_to(&to);
        plan.commands.push(PlannedCommand {
            command: PrimitiveCommand::FreeMove {
                x: to.x,
                y: to.y,
                c: to.c,
            },
            estimated: self.travel_time(distance),
            pose: PlannedPose {
                position: to,
                track: None,
            },
        });
        plan.total_cost_mm = distance;
        plan
    }

    /// Dijkstra over the track graph.
    ///
    /// Cost is the summed length (in whole millimeters) of the tracks
    /// entered after the source; equal-cost routes tie-break on the
    /// lower minimum track id along the route.
    fn shortest_route(&self, from: TrackId, to: TrackId) -> Result<Vec<TrackId>, PlanError> {
        if from == to {
            return Ok(vec![from]);
        }

        let no_route = PlanError::NoRoute {
            from_track: from,
            to_track: to,
        };
        let (&start, &goal) = match (self.nodes.get(&from), self.nodes.get(&to)) {
            (Some(s), Some(g)) => (s, g),
            _ => return Err(no_route),
        };

        // (cost_mm, min track id on route) per node, lexicographic.
        let mut best: HashMap<NodeIndex, (u64, TrackId)> = HashMap::new();
        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut heap = BinaryHeap::new();

        best.insert(start, (0, from));
        heap.push(Reverse((0u64, from, start)));

        while let Some(Reverse((cost, min_id, node))) = heap.pop() {
            if best.get(&node).is_some_and(|&(c, m)| (c, m) < (cost, min_id)) {
                continue;
            }
            if node == goal {
                break;
            }

            let mut edges: Vec<_> = self
                .graph
                .edges(node)
                .map(|e| (e.target(), *e.weight()))
                .collect();
            // Deterministic relaxation order.
            edges.sort_by_key(|(target, _)| self.graph[*target]);

            for (target, weight) in edges {
                let next_cost = cost.saturating_add(weight.round().max(0.0) as u64);
                let next_min = min_id.min(self.graph[target]);
                let candidate = (next_cost, next_min);
                if best
                    .get(&target)
                    .is_none_or(|&(c, m)| candidate < (c, m))
                {
                    best.insert(target, candidate);
                    previous.insert(target, node);
                    heap.push(Reverse((next_cost, next_min, target)));
                }
            }
        }

        if !best.contains_key(&goal) {
            return Err(no_route);
        }

        let mut route = vec![self.graph[goal]];
        let mut cursor = goal;
        while cursor != start {
            let Some(&prev) = previous.get(&cursor) else {
                return Err(no_route);
            };
            cursor = prev;
            route.push(self.graph[cursor]);
        }
        route.reverse();
        Ok(route)
    }

    fn emit_route(
        &self,
        from: Position,
        to: Position,
        source_distance: f64,
        target: TrackCoord,
        route: &[TrackId],
    ) -> Result<Plan, PlanError> {
        let mut plan = Plan::default();

        let first_id = *route.first().ok_or(PlanError::NoRoute {
            from_track: target.track_id,
            to_track: target.track_id,
        })?;
        let first = self.track(first_id, target)?;

        // Approach and mount the first track.
        let hop_point = first.position_at(source_distance);
        let approach = from.distance_to(&hop_point);
        plan.commands.push(PlannedCommand {
            command: PrimitiveCommand::HopOn {
                track_id: first_id,
                distance: source_distance,
            },
            estimated: self.travel_time(approach) + self.config.hop_time,
            pose: PlannedPose {
                position: hop_point,
                track: Some(TrackCoord {
                    track_id: first_id,
                    distance: source_distance,
                }),
            },
        });
        plan.total_cost_mm += approach;

        let mut current_track = first_id;
        let mut current_distance = source_distance;

        for pair in route.windows(2) {
            let (here_id, next_id) = (pair[0], pair[1]);
            let here = self.track(here_id, target)?;
            let next = self.track(next_id, target)?;
            let (exit_distance, entry_distance) =
                junction(here, next, self.config.connect_epsilon_mm).ok_or(PlanError::NoRoute {
                    from_track: here_id,
                    to_track: next_id,
                })?;

            self.push_follow(&mut plan, here, current_distance, exit_distance);
            plan.commands.push(PlannedCommand {
                command: PrimitiveCommand::Transition {
                    from_track: here_id,
                    to_track: next_id,
                },
                estimated: self.config.transition_time,
                pose: PlannedPose {
                    position: next.position_at(entry_distance),
                    track: Some(TrackCoord {
                        track_id: next_id,
                        distance: entry_distance,
                    }),
                },
            });

            current_track = next_id;
            current_distance = entry_distance;
        }

        // Traverse the final track to the target coordinate.
        let last = self.track(current_track, target)?;
        self.push_follow(&mut plan, last, current_distance, target.distance);

        // Leave the track when the destination is off it.
        let track_point = last.position_at(target.distance);
        let separation = track_point.distance_to(&to);
        if separation > self.config.arrival_epsilon_mm {
            plan.commands.push(PlannedCommand {
                command: PrimitiveCommand::HopOff { x: to.x, y: to.y },
                estimated: self.travel_time(separation) + self.config.hop_time,
                pose: PlannedPose {
                    position: Position::new(to.x, to.y),
                    track: None,
                },
            });
            plan.total_cost_mm += separation;
        }

        let final_heading = plan
            .commands
            .last()
            .map(|c| c.pose.position.c)
            .unwrap_or(from.c);
        if self.heading_delta(final_heading, to.c) > self.config.heading_epsilon_deg {
            let on_track = plan.commands.last().and_then(|c| c.pose.track);
            self.push_rotate(&mut plan, to, on_track);
        }

        Ok(plan)
    }

    fn track(&self, track_id: TrackId, target: TrackCoord) -> Result<&Track, PlanError> {
        self.tracks.get(track_id).ok_or(PlanError::NoRoute {
            from_track: track_id,
            to_track: target.track_id,
        })
    }

    fn push_follow(&self, plan: &mut Plan, track: &Track, from_distance: f64, to_distance: f64) {
        let run = (to_distance - from_distance).abs();
        if run <= self.config.arrival_epsilon_mm {
            return;
        }
        plan.commands.push(PlannedCommand {
            command: PrimitiveCommand::Follow {
                track_id: track.track_id,
                target_distance: to_distance,
            },
            estimated: self.travel_time(run),
            pose: PlannedPose {
                position: track.position_at(to_distance),
                track: Some(TrackCoord {
                    track_id: track.track_id,
                    distance: to_distance,
                }),
            },
        });
        plan.total_cost_mm += run;
    }

    fn push_rotate(&self, plan: &mut Plan, to: Position, track: Option<TrackCoord>) {
        let previous = plan
            .commands
            .last()
            .map(|c| c.pose.position)
            .unwrap_or(to);
        let delta = self.heading_delta(previous.c, to.c);
        plan.commands.push(PlannedCommand {
            command: PrimitiveCommand::Rotate { c: to.c },
            estimated: Duration::from_secs_f64(
                delta / self.config.rotate_speed_deg_s.max(1.0),
            ),
            pose: PlannedPose {
                position: Position::with_heading(previous.x, previous.y, to.c),
                track,
            },
        });
    }

    fn travel_time(&self, distance_mm: f64) -> Duration {
        Duration::from_secs_f64(distance_mm.max(0.0) / self.config.cruise_speed_mm_s.max(1.0))
    }
}

/// Matching endpoint pair of two connected tracks.
///
/// Returns `(distance on a, distance on b)` of the closest endpoint
/// pair within `epsilon`, or `None` when the tracks do not touch.
fn junction(a: &Track, b: &Track, epsilon: f64) -> Option<(f64, f64)> {
    let candidates = [
        (0.0, a.start(), 0.0, b.start()),
        (0.0, a.start(), b.length(), b.end()),
        (a.length(), a.end(), 0.0, b.start()),
        (a.length(), a.end(), b.length(), b.end()),
    ];

    candidates
        .iter()
        .filter_map(|(da, pa, db, pb)| {
            let gap = pa.distance_to(pb);
            (gap <= epsilon).then_some((gap, *da, *db))
        })
        .min_by(|x, y| x.0.total_cmp(&y.0))
        .map(|(_, da, db)| (da, db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use planar_core::GridPosition;

    fn track(id: TrackId, x0: f64, y0: f64, x1: f64, y1: f64) -> Track {
        Track::new(id, format!("t{id}"), x0, y0, x1, y1)
    }

    fn planner(deck: DeckConfig, tracks: Vec<Track>) -> PathPlanner {
        let map = TrackMap::from_tracks(tracks).unwrap_or_default();
        PathPlanner::new(deck, map, PlannerConfig::default())
    }

    #[test]
    fn within_one_millimeter_is_an_empty_plan() {
        let p = planner(DeckConfig::new("d", 2, 2), vec![]);
        let plan = p.plan(Position::new(100.0, 100.0), Position::new(100.5, 100.0));
        assert_eq!(plan, Ok(Plan::default()));
    }

    #[test]
    fn disabled_tile_is_unreachable() {
        let deck = DeckConfig::new("d", 2, 1).with_disabled_tile(GridPosition::new(1, 0));
        let p = planner(deck, vec![track(1, 60.0, 120.0, 420.0, 120.0)]);
        let result = p.plan(Position::new(60.0, 120.0), Position::new(300.0, 120.0));
        assert!(matches!(result, Err(PlanError::Unreachable { .. })));
    }

    #[test]
    fn same_tile_uses_free_move() {
        let p = planner(DeckConfig::new("d", 1, 1), vec![]);
        let plan = p.plan(Position::new(60.0, 60.0), Position::new(180.0, 180.0));
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            assert_eq!(plan.commands.len(), 1);
            assert!(matches!(
                plan.commands[0].command,
                PrimitiveCommand::FreeMove { .. }
            ));
        }
    }

    #[test]
    fn cross_tile_without_tracks_is_off_network() {
        let p = planner(DeckConfig::new("d", 2, 1), vec![]);
        let result = p.plan(Position::new(120.0, 120.0), Position::new(360.0, 120.0));
        assert!(matches!(result, Err(PlanError::OffNetwork { .. })));
    }

    #[test]
    fn single_track_route_hops_on_follows_and_hops_off() {
        let deck = DeckConfig::new("d", 2, 2);
        let p = planner(deck, vec![track(1, 60.0, 120.0, 420.0, 120.0)]);
        let plan = p.plan(Position::new(60.0, 60.0), Position::new(420.0, 180.0));
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            assert_eq!(plan.commands.len(), 3, "hop_on, follow, hop_off");
            assert!(matches!(
                plan.commands[0].command,
                PrimitiveCommand::HopOn { track_id: 1, .. }
            ));
            assert!(matches!(
                plan.commands[1].command,
                PrimitiveCommand::Follow { track_id: 1, .. }
            ));
            assert!(matches!(
                plan.commands[2].command,
                PrimitiveCommand::HopOff { .. }
            ));
            assert!(plan.total_cost_mm > 0.0);
        }
    }

    #[test]
    fn connected_tracks_transition_at_junction() {
        let deck = DeckConfig::new("d", 3, 3);
        let p = planner(
            deck,
            vec![
                track(1, 60.0, 120.0, 420.0, 120.0),
                track(2, 420.0, 120.0, 420.0, 600.0),
            ],
        );
        let plan = p.plan(Position::new(60.0, 120.0), Position::new(420.0, 600.0));
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            assert!(plan.commands.iter().any(|c| matches!(
                c.command,
                PrimitiveCommand::Transition {
                    from_track: 1,
                    to_track: 2
                }
            )));
        }
    }

    #[test]
    fn disconnected_tracks_have_no_route() {
        let deck = DeckConfig::new("d", 4, 1);
        let p = planner(
            deck,
            vec![
                track(1, 60.0, 120.0, 180.0, 120.0),
                track(2, 780.0, 120.0, 900.0, 120.0),
            ],
        );
        let result = p.plan(Position::new(60.0, 120.0), Position::new(900.0, 120.0));
        assert_eq!(
            result,
            Err(PlanError::NoRoute {
                from_track: 1,
                to_track: 2
            })
        );
    }

    #[test]
    fn equal_cost_routes_resolve_to_lower_track_ids() {
        // Two parallel middle legs of identical length between the same
        // junction points: 1 -> {2 | 3} -> 4. The route through track 2
        // must win deterministically.
        let deck = DeckConfig::new("d", 4, 3);
        let p = planner(
            deck,
            vec![
                track(1, 60.0, 120.0, 300.0, 120.0),
                track(2, 300.0, 120.0, 660.0, 120.0),
                track(3, 300.0, 120.0, 660.0, 120.0),
                track(4, 660.0, 120.0, 900.0, 120.0),
            ],
        );
        let plan = p.plan(Position::new(60.0, 120.0), Position::new(900.0, 180.0));
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            let transitions: Vec<_> = plan
                .commands
                .iter()
                .filter_map(|c| match c.command {
                    PrimitiveCommand::Transition { to_track, .. } => Some(to_track),
                    _ => None,
                })
                .collect();
            assert_eq!(transitions, vec![2, 4]);
        }
    }

    #[test]
    fn heading_only_change_is_a_rotate() {
        let p = planner(DeckConfig::new("d", 1, 1), vec![]);
        let plan = p.plan(
            Position::new(60.0, 60.0),
            Position::with_heading(60.0, 60.0, 90.0),
        );
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            assert_eq!(plan.commands.len(), 1);
            assert!(matches!(
                plan.commands.last().map(|c| &c.command),
                Some(PrimitiveCommand::Rotate { c }) if *c == 90.0
            ));
        }
    }

    #[test]
    fn free_move_carries_the_target_heading() {
        let p = planner(DeckConfig::new("d", 1, 1), vec![]);
        let plan = p.plan(
            Position::new(60.0, 60.0),
            Position::with_heading(180.0, 60.0, 90.0),
        );
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            assert_eq!(plan.commands.len(), 1);
            assert!(matches!(
                plan.commands[0].command,
                PrimitiveCommand::FreeMove { c, .. } if c == 90.0
            ));
        }
    }

    #[test]
    fn estimate_matches_plan_cost() {
        let deck = DeckConfig::new("d", 2, 2);
        let p = planner(deck, vec![track(1, 60.0, 120.0, 420.0, 120.0)]);
        let from = Position::new(60.0, 60.0);
        let to = Position::new(420.0, 180.0);
        let cost = p.plan(from, to).map(|plan| plan.total_cost_mm).ok();
        assert_eq!(p.estimate(from, to), cost);
    }

    #[test]
    fn location_track_coordinates_are_honored() {
        let deck = DeckConfig::new("d", 2, 2);
        let p = planner(deck, vec![track(1, 60.0, 120.0, 420.0, 120.0)]);
        let queue = Location::new(
            "loc-q",
            "QUEUE_1",
            planar_core::LocationType::Queue,
            300.0,
            120.0,
        )
        .on_track(1, 240.0);
        let plan = p.plan_to_location(Position::new(60.0, 60.0), &queue);
        assert!(plan.is_ok());
        if let Ok(plan) = plan {
            assert!(plan.commands.iter().any(|c| matches!(
                c.command,
                PrimitiveCommand::Follow {
                    track_id: 1,
                    target_distance
                } if target_distance == 240.0
            )));
            // Queue point sits on the track: no hop_off.
            assert!(!plan
                .commands
                .iter()
                .any(|c| matches!(c.command, PrimitiveCommand::HopOff { .. })));
        }
    }
}
